//! Compensation table for the fulfillment saga.
//!
//! The state an instance is in tells which steps already completed, and so
//! which commands undo them. Compensations are emitted newest step first.

use common::BusinessKey;

use super::{FulfillmentCommand, FulfillmentData, FulfillmentState, OrderStatus};

/// A downstream step that has to be undone when the saga unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedStep {
    InventoryReserved,
    PaymentCaptured,
    OrderConfirmed,
}

/// Steps completed before reaching `state`, oldest first.
pub fn completed_steps(state: FulfillmentState) -> &'static [CompletedStep] {
    match state {
        FulfillmentState::AwaitingPayment => &[CompletedStep::InventoryReserved],
        FulfillmentState::AwaitingShipment => &[
            CompletedStep::InventoryReserved,
            CompletedStep::PaymentCaptured,
            CompletedStep::OrderConfirmed,
        ],
        FulfillmentState::Created
        | FulfillmentState::AwaitingInventory
        | FulfillmentState::Completed
        | FulfillmentState::Cancelled => &[],
    }
}

fn undo(step: CompletedStep, key: &BusinessKey, data: &FulfillmentData) -> FulfillmentCommand {
    match step {
        CompletedStep::InventoryReserved => FulfillmentCommand::ReleaseInventory {
            order_id: key.clone(),
            reservation_id: data.reservation_id.clone(),
        },
        CompletedStep::PaymentCaptured => FulfillmentCommand::RefundPayment {
            order_id: key.clone(),
            payment_reference: data.payment_reference.clone(),
            amount: data.amount.unwrap_or_default(),
        },
        CompletedStep::OrderConfirmed => FulfillmentCommand::UpdateOrderStatus {
            order_id: key.clone(),
            status: OrderStatus::Cancelled,
        },
    }
}

/// Compensating commands for failing out of `state`, newest step first.
pub fn compensations(
    state: FulfillmentState,
    key: &BusinessKey,
    data: &FulfillmentData,
) -> Vec<FulfillmentCommand> {
    completed_steps(state)
        .iter()
        .rev()
        .map(|step| undo(*step, key, data))
        .collect()
}

/// Full unwind from `state`: the compensations followed by the customer notice.
pub fn unwind(
    state: FulfillmentState,
    key: &BusinessKey,
    data: &FulfillmentData,
    reason: &str,
) -> Vec<FulfillmentCommand> {
    let mut commands = compensations(state, key, data);
    commands.push(FulfillmentCommand::NotifyCustomerCancelled {
        order_id: key.clone(),
        customer_email: data.customer_email.clone(),
        reason: reason.to_string(),
    });
    commands
}
