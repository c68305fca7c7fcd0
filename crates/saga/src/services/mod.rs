//! Downstream service traits and in-memory implementations for the saga steps.

pub mod downstream;
pub mod inventory;
pub mod notification;
pub mod payment;
pub mod shipping;

pub use downstream::{Downstream, InMemoryDownstream};
pub use inventory::{InMemoryInventoryService, InventoryService};
pub use notification::{
    InMemoryNotificationService, InMemoryOrderStatusService, Notification, NotificationService,
    OrderStatusService,
};
pub use payment::{InMemoryPaymentService, PaymentReceipt, PaymentService};
pub use shipping::{InMemoryShippingService, ShippingService};
