//! Customer notification and order status services.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::BusinessKey;
use domain::OrderStatus;

use crate::error::SagaError;

/// A message sent to a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub order_id: BusinessKey,
    pub customer_email: String,
    pub body: String,
}

/// Trait for customer notifications.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), SagaError>;
}

/// Trait for the order service's status updates.
#[async_trait]
pub trait OrderStatusService: Send + Sync {
    async fn update_status(&self, order_id: &BusinessKey, status: OrderStatus)
    -> Result<(), SagaError>;
}

/// In-memory notification service that records what was sent.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the notifications sent for an order, in order.
    pub fn sent_to(&self, order_id: &BusinessKey) -> Vec<Notification> {
        self.sent
            .read()
            .unwrap()
            .iter()
            .filter(|n| &n.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Returns the number of notifications sent.
    pub fn sent_count(&self) -> usize {
        self.sent.read().unwrap().len()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn notify(&self, notification: Notification) -> Result<(), SagaError> {
        self.sent.write().unwrap().push(notification);
        Ok(())
    }
}

/// In-memory order status service. Keeps the status history per order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStatusService {
    history: Arc<RwLock<HashMap<BusinessKey, Vec<OrderStatus>>>>,
}

impl InMemoryOrderStatusService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest status pushed for an order.
    pub fn status_of(&self, order_id: &BusinessKey) -> Option<OrderStatus> {
        self.history
            .read()
            .unwrap()
            .get(order_id)
            .and_then(|statuses| statuses.last().copied())
    }

    /// Returns every status pushed for an order.
    pub fn history_of(&self, order_id: &BusinessKey) -> Vec<OrderStatus> {
        self.history
            .read()
            .unwrap()
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderStatusService for InMemoryOrderStatusService {
    async fn update_status(
        &self,
        order_id: &BusinessKey,
        status: OrderStatus,
    ) -> Result<(), SagaError> {
        self.history
            .write()
            .unwrap()
            .entry(order_id.clone())
            .or_default()
            .push(status);
        Ok(())
    }
}
