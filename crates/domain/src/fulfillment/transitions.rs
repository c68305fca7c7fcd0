//! Transition functions of the fulfillment saga.

use crate::error::GuardViolation;
use crate::transition::{Step, TransitionTable, set_once};
use crate::workflow::{SagaState, WorkflowEvent};

use super::compensation::unwind;
use super::event_types::*;
use super::{
    FulfillmentCommand, FulfillmentData, FulfillmentEvent, FulfillmentState, OrderFulfillment,
    OrderStatus,
};

type Result = std::result::Result<Step<OrderFulfillment>, GuardViolation>;

/// Expected-event label for the shared failure path, which accepts several types.
const STEP_FAILURE: &str = "a step failure or cancellation";

/// Builds the fulfillment transition table.
pub fn build_table() -> TransitionTable<OrderFulfillment> {
    use FulfillmentState::*;

    TransitionTable::new()
        .on(Created, ORDER_CREATED, order_created)
        .on(AwaitingInventory, INVENTORY_RESERVED, inventory_reserved)
        .on(AwaitingInventory, INVENTORY_RESERVATION_FAILED, step_failed)
        .on(AwaitingPayment, PAYMENT_SUCCEEDED, payment_succeeded)
        .on(AwaitingPayment, PAYMENT_FAILED, step_failed)
        .on(AwaitingShipment, SHIPMENT_CREATED, shipment_created)
        .on(AwaitingShipment, SHIPMENT_FAILED, step_failed)
        .on_each(&FulfillmentState::AWAITING, ORDER_CANCELLED_BY_USER, step_failed)
        .on_each(&FulfillmentState::AWAITING, STEP_TIMED_OUT, step_timed_out)
}

fn mismatch(expected: &'static str, event: &FulfillmentEvent) -> GuardViolation {
    GuardViolation::EventMismatch {
        expected,
        actual: event.event_type(),
    }
}

fn order_created(
    _state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
) -> Result {
    let FulfillmentEvent::OrderCreated(created) = event else {
        return Err(mismatch(ORDER_CREATED, event));
    };

    let mut data = data.clone();
    data.order_id = Some(created.order_id.clone());
    data.customer_email = created.customer_email.clone();
    data.amount = Some(created.amount);
    data.lines = created.lines.clone();

    let reserve = FulfillmentCommand::ReserveInventory {
        order_id: created.order_id.clone(),
        lines: created.lines.clone(),
    };
    Ok(Step::new(
        FulfillmentState::AwaitingInventory,
        data,
        vec![reserve],
    ))
}

fn inventory_reserved(
    _state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
) -> Result {
    let FulfillmentEvent::InventoryReserved(reserved) = event else {
        return Err(mismatch(INVENTORY_RESERVED, event));
    };
    let amount = data
        .amount
        .ok_or(GuardViolation::MissingField { field: "amount" })?;

    let mut data = data.clone();
    set_once(
        &mut data.reservation_id,
        reserved.reservation_id.clone(),
        "reservation_id",
    )?;

    let pay = FulfillmentCommand::RequestPayment {
        order_id: reserved.order_id.clone(),
        amount,
    };
    Ok(Step::new(FulfillmentState::AwaitingPayment, data, vec![pay]))
}

fn payment_succeeded(
    _state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
) -> Result {
    let FulfillmentEvent::PaymentSucceeded(paid) = event else {
        return Err(mismatch(PAYMENT_SUCCEEDED, event));
    };
    let expected = data
        .amount
        .ok_or(GuardViolation::MissingField { field: "amount" })?;
    if paid.amount != expected {
        return Err(GuardViolation::AmountMismatch {
            expected: expected.to_string(),
            actual: paid.amount.to_string(),
        });
    }

    let mut data = data.clone();
    set_once(
        &mut data.payment_reference,
        paid.payment_reference.clone(),
        "payment_reference",
    )?;

    let commands = vec![
        FulfillmentCommand::RequestShipment {
            order_id: paid.order_id.clone(),
            lines: data.lines.clone(),
        },
        FulfillmentCommand::UpdateOrderStatus {
            order_id: paid.order_id.clone(),
            status: OrderStatus::Confirmed,
        },
    ];
    Ok(Step::new(FulfillmentState::AwaitingShipment, data, commands))
}

fn shipment_created(
    _state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
) -> Result {
    let FulfillmentEvent::ShipmentCreated(shipped) = event else {
        return Err(mismatch(SHIPMENT_CREATED, event));
    };

    let mut data = data.clone();
    set_once(
        &mut data.tracking_number,
        shipped.tracking_number.clone(),
        "tracking_number",
    )?;

    let notify = FulfillmentCommand::NotifyCustomerShipped {
        order_id: shipped.order_id.clone(),
        customer_email: data.customer_email.clone(),
        tracking_number: shipped.tracking_number.clone(),
    };
    Ok(Step::new(FulfillmentState::Completed, data, vec![notify]))
}

/// Failure results and user cancellation share one unwind path.
fn step_failed(
    state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
) -> Result {
    let failure = match event {
        FulfillmentEvent::InventoryReservationFailed(d)
        | FulfillmentEvent::PaymentFailed(d)
        | FulfillmentEvent::ShipmentFailed(d)
        | FulfillmentEvent::OrderCancelledByUser(d) => d,
        other => return Err(mismatch(STEP_FAILURE, other)),
    };

    Ok(cancel(state, data, event, &failure.reason))
}

fn step_timed_out(
    state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
) -> Result {
    let FulfillmentEvent::StepTimedOut(timeout) = event else {
        return Err(mismatch(STEP_TIMED_OUT, event));
    };
    if timeout.awaiting != state {
        return Err(GuardViolation::StaleTimeout {
            awaiting: timeout.awaiting.as_str().to_string(),
            current: state.as_str().to_string(),
        });
    }

    let reason = format!("timed out in {state}");
    Ok(cancel(state, data, event, &reason))
}

fn cancel(
    state: FulfillmentState,
    data: &FulfillmentData,
    event: &FulfillmentEvent,
    reason: &str,
) -> Step<OrderFulfillment> {
    let mut data = data.clone();
    data.record_failure(reason);
    let commands = unwind(state, &event.business_key(), &data, reason);
    Step::new(FulfillmentState::Cancelled, data, commands)
}
