//! Events driving the fulfillment saga.

use common::BusinessKey;
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowEvent;

use super::{FulfillmentState, Money, OrderLine};

/// Event type names, as used in the transition table.
pub mod event_types {
    pub const ORDER_CREATED: &str = "OrderCreated";
    pub const INVENTORY_RESERVED: &str = "InventoryReserved";
    pub const INVENTORY_RESERVATION_FAILED: &str = "InventoryReservationFailed";
    pub const PAYMENT_SUCCEEDED: &str = "PaymentSucceeded";
    pub const PAYMENT_FAILED: &str = "PaymentFailed";
    pub const SHIPMENT_CREATED: &str = "ShipmentCreated";
    pub const SHIPMENT_FAILED: &str = "ShipmentFailed";
    pub const ORDER_CANCELLED_BY_USER: &str = "OrderCancelledByUser";
    pub const STEP_TIMED_OUT: &str = "StepTimedOut";
    pub const COMPENSATION_FAILED: &str = "CompensationFailed";
}

use event_types::*;

/// Events the fulfillment saga consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FulfillmentEvent {
    /// An order was placed. Starts the saga.
    OrderCreated(OrderCreatedData),

    /// Stock was reserved for the order.
    InventoryReserved(InventoryReservedData),

    /// Stock could not be reserved.
    InventoryReservationFailed(StepFailedData),

    /// Payment was captured.
    PaymentSucceeded(PaymentSucceededData),

    /// Payment was declined.
    PaymentFailed(StepFailedData),

    /// The order was handed to the carrier.
    ShipmentCreated(ShipmentCreatedData),

    /// The shipment could not be created.
    ShipmentFailed(StepFailedData),

    /// The customer cancelled the order.
    OrderCancelledByUser(StepFailedData),

    /// A downstream step did not answer in time. Raised by an external sweep.
    StepTimedOut(StepTimedOutData),

    /// A compensating command could not be applied downstream.
    CompensationFailed(CompensationFailedData),
}

impl WorkflowEvent for FulfillmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FulfillmentEvent::OrderCreated(_) => ORDER_CREATED,
            FulfillmentEvent::InventoryReserved(_) => INVENTORY_RESERVED,
            FulfillmentEvent::InventoryReservationFailed(_) => INVENTORY_RESERVATION_FAILED,
            FulfillmentEvent::PaymentSucceeded(_) => PAYMENT_SUCCEEDED,
            FulfillmentEvent::PaymentFailed(_) => PAYMENT_FAILED,
            FulfillmentEvent::ShipmentCreated(_) => SHIPMENT_CREATED,
            FulfillmentEvent::ShipmentFailed(_) => SHIPMENT_FAILED,
            FulfillmentEvent::OrderCancelledByUser(_) => ORDER_CANCELLED_BY_USER,
            FulfillmentEvent::StepTimedOut(_) => STEP_TIMED_OUT,
            FulfillmentEvent::CompensationFailed(_) => COMPENSATION_FAILED,
        }
    }

    fn business_key(&self) -> BusinessKey {
        let key = match self {
            FulfillmentEvent::OrderCreated(d) => &d.order_id,
            FulfillmentEvent::InventoryReserved(d) => &d.order_id,
            FulfillmentEvent::PaymentSucceeded(d) => &d.order_id,
            FulfillmentEvent::ShipmentCreated(d) => &d.order_id,
            FulfillmentEvent::InventoryReservationFailed(d)
            | FulfillmentEvent::PaymentFailed(d)
            | FulfillmentEvent::ShipmentFailed(d)
            | FulfillmentEvent::OrderCancelledByUser(d) => &d.order_id,
            FulfillmentEvent::StepTimedOut(d) => &d.order_id,
            FulfillmentEvent::CompensationFailed(d) => &d.order_id,
        };
        key.clone()
    }
}

impl FulfillmentEvent {
    pub fn order_created(
        order_id: impl Into<BusinessKey>,
        customer_email: impl Into<String>,
        amount: Money,
        lines: Vec<OrderLine>,
    ) -> Self {
        FulfillmentEvent::OrderCreated(OrderCreatedData {
            order_id: order_id.into(),
            customer_email: customer_email.into(),
            amount,
            lines,
        })
    }

    pub fn inventory_reserved(
        order_id: impl Into<BusinessKey>,
        reservation_id: impl Into<String>,
    ) -> Self {
        FulfillmentEvent::InventoryReserved(InventoryReservedData {
            order_id: order_id.into(),
            reservation_id: reservation_id.into(),
        })
    }

    pub fn inventory_reservation_failed(
        order_id: impl Into<BusinessKey>,
        reason: impl Into<String>,
    ) -> Self {
        FulfillmentEvent::InventoryReservationFailed(StepFailedData::new(order_id, reason))
    }

    pub fn payment_succeeded(
        order_id: impl Into<BusinessKey>,
        payment_reference: impl Into<String>,
        amount: Money,
    ) -> Self {
        FulfillmentEvent::PaymentSucceeded(PaymentSucceededData {
            order_id: order_id.into(),
            payment_reference: payment_reference.into(),
            amount,
        })
    }

    pub fn payment_failed(order_id: impl Into<BusinessKey>, reason: impl Into<String>) -> Self {
        FulfillmentEvent::PaymentFailed(StepFailedData::new(order_id, reason))
    }

    pub fn shipment_created(
        order_id: impl Into<BusinessKey>,
        tracking_number: impl Into<String>,
    ) -> Self {
        FulfillmentEvent::ShipmentCreated(ShipmentCreatedData {
            order_id: order_id.into(),
            tracking_number: tracking_number.into(),
        })
    }

    pub fn shipment_failed(order_id: impl Into<BusinessKey>, reason: impl Into<String>) -> Self {
        FulfillmentEvent::ShipmentFailed(StepFailedData::new(order_id, reason))
    }

    pub fn cancelled_by_user(order_id: impl Into<BusinessKey>, reason: impl Into<String>) -> Self {
        FulfillmentEvent::OrderCancelledByUser(StepFailedData::new(order_id, reason))
    }

    pub fn step_timed_out(order_id: impl Into<BusinessKey>, awaiting: FulfillmentState) -> Self {
        FulfillmentEvent::StepTimedOut(StepTimedOutData {
            order_id: order_id.into(),
            awaiting,
        })
    }

    pub fn compensation_failed(
        order_id: impl Into<BusinessKey>,
        command_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        FulfillmentEvent::CompensationFailed(CompensationFailedData {
            order_id: order_id.into(),
            command_type: command_type.into(),
            reason: reason.into(),
        })
    }
}

/// Data for OrderCreated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: BusinessKey,
    pub customer_email: String,
    /// Total the customer is charged.
    pub amount: Money,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
}

/// Data for InventoryReserved event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReservedData {
    pub order_id: BusinessKey,
    pub reservation_id: String,
}

/// Data for PaymentSucceeded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceededData {
    pub order_id: BusinessKey,
    pub payment_reference: String,
    /// Amount actually captured.
    pub amount: Money,
}

/// Data for ShipmentCreated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentCreatedData {
    pub order_id: BusinessKey,
    pub tracking_number: String,
}

/// Data for failure and cancellation events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub order_id: BusinessKey,
    pub reason: String,
}

impl StepFailedData {
    pub fn new(order_id: impl Into<BusinessKey>, reason: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            reason: reason.into(),
        }
    }
}

/// Data for StepTimedOut event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTimedOutData {
    pub order_id: BusinessKey,
    /// The state the sweep saw the instance waiting in.
    pub awaiting: FulfillmentState,
}

/// Data for CompensationFailed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailedData {
    pub order_id: BusinessKey,
    pub command_type: String,
    pub reason: String,
}
