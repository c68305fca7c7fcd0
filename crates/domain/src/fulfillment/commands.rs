//! Commands emitted by the fulfillment saga.

use common::BusinessKey;
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowCommand;

use super::{Money, OrderLine};

/// Bus topics commands are published to.
pub mod topics {
    pub const INVENTORY: &str = "inventory.commands";
    pub const PAYMENT: &str = "payment.commands";
    pub const SHIPMENT: &str = "shipment.commands";
    pub const ORDER: &str = "order.commands";
    pub const NOTIFICATION: &str = "notification.commands";

    /// Every command topic.
    pub const ALL: [&str; 5] = [INVENTORY, PAYMENT, SHIPMENT, ORDER, NOTIFICATION];
}

/// Order status pushed to the order service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Confirmed,
    Cancelled,
}

/// Commands the fulfillment saga sends to downstream services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FulfillmentCommand {
    ReserveInventory {
        order_id: BusinessKey,
        lines: Vec<OrderLine>,
    },
    ReleaseInventory {
        order_id: BusinessKey,
        reservation_id: Option<String>,
    },
    RequestPayment {
        order_id: BusinessKey,
        amount: Money,
    },
    RefundPayment {
        order_id: BusinessKey,
        payment_reference: Option<String>,
        amount: Money,
    },
    RequestShipment {
        order_id: BusinessKey,
        lines: Vec<OrderLine>,
    },
    UpdateOrderStatus {
        order_id: BusinessKey,
        status: OrderStatus,
    },
    NotifyCustomerShipped {
        order_id: BusinessKey,
        customer_email: String,
        tracking_number: String,
    },
    NotifyCustomerCancelled {
        order_id: BusinessKey,
        customer_email: String,
        reason: String,
    },
}

impl WorkflowCommand for FulfillmentCommand {
    fn command_type(&self) -> &'static str {
        match self {
            FulfillmentCommand::ReserveInventory { .. } => "ReserveInventory",
            FulfillmentCommand::ReleaseInventory { .. } => "ReleaseInventory",
            FulfillmentCommand::RequestPayment { .. } => "RequestPayment",
            FulfillmentCommand::RefundPayment { .. } => "RefundPayment",
            FulfillmentCommand::RequestShipment { .. } => "RequestShipment",
            FulfillmentCommand::UpdateOrderStatus { .. } => "UpdateOrderStatus",
            FulfillmentCommand::NotifyCustomerShipped { .. } => "NotifyCustomerShipped",
            FulfillmentCommand::NotifyCustomerCancelled { .. } => "NotifyCustomerCancelled",
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            FulfillmentCommand::ReserveInventory { .. }
            | FulfillmentCommand::ReleaseInventory { .. } => topics::INVENTORY,
            FulfillmentCommand::RequestPayment { .. } | FulfillmentCommand::RefundPayment { .. } => {
                topics::PAYMENT
            }
            FulfillmentCommand::RequestShipment { .. } => topics::SHIPMENT,
            FulfillmentCommand::UpdateOrderStatus { .. } => topics::ORDER,
            FulfillmentCommand::NotifyCustomerShipped { .. }
            | FulfillmentCommand::NotifyCustomerCancelled { .. } => topics::NOTIFICATION,
        }
    }

    fn business_key(&self) -> BusinessKey {
        match self {
            FulfillmentCommand::ReserveInventory { order_id, .. }
            | FulfillmentCommand::ReleaseInventory { order_id, .. }
            | FulfillmentCommand::RequestPayment { order_id, .. }
            | FulfillmentCommand::RefundPayment { order_id, .. }
            | FulfillmentCommand::RequestShipment { order_id, .. }
            | FulfillmentCommand::UpdateOrderStatus { order_id, .. }
            | FulfillmentCommand::NotifyCustomerShipped { order_id, .. }
            | FulfillmentCommand::NotifyCustomerCancelled { order_id, .. } => order_id.clone(),
        }
    }

    fn is_compensation(&self) -> bool {
        matches!(
            self,
            FulfillmentCommand::ReleaseInventory { .. }
                | FulfillmentCommand::RefundPayment { .. }
                | FulfillmentCommand::UpdateOrderStatus {
                    status: OrderStatus::Cancelled,
                    ..
                }
        )
    }
}
