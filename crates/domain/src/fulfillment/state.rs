//! Fulfillment saga states.

use serde::{Deserialize, Serialize};

use crate::workflow::SagaState;

/// The state of an order fulfillment saga.
///
/// State transitions:
/// ```text
/// Created ──► AwaitingInventory ──► AwaitingPayment ──► AwaitingShipment ──► Completed
///                    │                     │                   │
///                    └─────────────────────┴───────────────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FulfillmentState {
    /// Fresh instance, only ever seen before the start event is applied.
    #[default]
    Created,

    /// Waiting for the inventory service to reserve stock.
    AwaitingInventory,

    /// Stock reserved, waiting for the payment result.
    AwaitingPayment,

    /// Payment captured, waiting for the shipment.
    AwaitingShipment,

    /// Order shipped (terminal state).
    Completed,

    /// Order unwound (terminal state).
    Cancelled,
}

impl FulfillmentState {
    /// States in which the saga waits on a downstream step.
    pub const AWAITING: [FulfillmentState; 3] = [
        FulfillmentState::AwaitingInventory,
        FulfillmentState::AwaitingPayment,
        FulfillmentState::AwaitingShipment,
    ];

    /// Returns true if the saga is waiting on a downstream step.
    pub fn is_awaiting(&self) -> bool {
        Self::AWAITING.contains(self)
    }
}

impl SagaState for FulfillmentState {
    fn as_str(&self) -> &'static str {
        match self {
            FulfillmentState::Created => "Created",
            FulfillmentState::AwaitingInventory => "AwaitingInventory",
            FulfillmentState::AwaitingPayment => "AwaitingPayment",
            FulfillmentState::AwaitingShipment => "AwaitingShipment",
            FulfillmentState::Completed => "Completed",
            FulfillmentState::Cancelled => "Cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "Created" => Some(FulfillmentState::Created),
            "AwaitingInventory" => Some(FulfillmentState::AwaitingInventory),
            "AwaitingPayment" => Some(FulfillmentState::AwaitingPayment),
            "AwaitingShipment" => Some(FulfillmentState::AwaitingShipment),
            "Completed" => Some(FulfillmentState::Completed),
            "Cancelled" => Some(FulfillmentState::Cancelled),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, FulfillmentState::Completed | FulfillmentState::Cancelled)
    }
}

impl std::fmt::Display for FulfillmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
