//! Order fulfillment saga.
//!
//! Drives an order through inventory reservation, payment and shipment, or
//! unwinds the completed steps when one of them fails, the customer cancels
//! or a step times out.

mod commands;
pub mod compensation;
mod data;
mod events;
mod state;
mod transitions;
mod value_objects;

pub use commands::{FulfillmentCommand, OrderStatus, topics};
pub use data::FulfillmentData;
pub use events::{
    CompensationFailedData, FulfillmentEvent, InventoryReservedData, OrderCreatedData,
    PaymentSucceededData, ShipmentCreatedData, StepFailedData, StepTimedOutData, event_types,
};
pub use state::FulfillmentState;
pub use transitions::build_table;
pub use value_objects::{MAX_SCALE, Money, MoneyParseError, OrderLine, ProductId};

use crate::transition::TransitionTable;
use crate::workflow::{CompensationFailureReport, Workflow};

/// Topic the saga consumes its events from.
pub const EVENTS_TOPIC: &str = "order-fulfillment.events";

/// The order fulfillment workflow.
pub struct OrderFulfillment {
    table: TransitionTable<OrderFulfillment>,
}

impl OrderFulfillment {
    pub fn new() -> Self {
        Self {
            table: build_table(),
        }
    }
}

impl Default for OrderFulfillment {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow for OrderFulfillment {
    const SAGA_TYPE: &'static str = "OrderFulfillment";

    type State = FulfillmentState;
    type Event = FulfillmentEvent;
    type Command = FulfillmentCommand;
    type Data = FulfillmentData;

    fn initial_state(&self) -> FulfillmentState {
        FulfillmentState::Created
    }

    fn is_start_event(&self, event: &FulfillmentEvent) -> bool {
        matches!(event, FulfillmentEvent::OrderCreated(_))
    }

    fn transitions(&self) -> &TransitionTable<Self> {
        &self.table
    }

    fn start_conflict(&self, data: &FulfillmentData, event: &FulfillmentEvent) -> Option<String> {
        let FulfillmentEvent::OrderCreated(created) = event else {
            return None;
        };

        let mut differences = Vec::new();
        if data.amount != Some(created.amount) {
            differences.push("amount");
        }
        if data.customer_email != created.customer_email {
            differences.push("customer_email");
        }
        if data.lines != created.lines {
            differences.push("lines");
        }

        if differences.is_empty() {
            None
        } else {
            Some(format!(
                "redelivered OrderCreated disagrees with stored order on {}",
                differences.join(", ")
            ))
        }
    }

    fn compensation_failure(&self, event: &FulfillmentEvent) -> Option<CompensationFailureReport> {
        match event {
            FulfillmentEvent::CompensationFailed(failed) => Some(CompensationFailureReport {
                command_type: failed.command_type.clone(),
                reason: failed.reason.clone(),
            }),
            _ => None,
        }
    }
}
