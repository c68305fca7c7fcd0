//! Event bus abstraction and in-memory implementation.
//!
//! The bus delivers at least once and gives no ordering guarantee across
//! topics. Messages carry the business key so consumers can partition work.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BusinessKey, MessageId};
use domain::WorkflowEvent;
use saga_store::OutboxMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by an event bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The broker refused or could not take the message.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// A message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: MessageId,
    pub topic: String,
    /// Event or command type name.
    pub message_type: String,
    pub key: BusinessKey,
    pub payload: serde_json::Value,
    /// Set for saga commands; downstream consumers drop repeats.
    pub idempotency_key: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    /// Wraps a workflow event for publishing.
    pub fn event<E: WorkflowEvent>(
        topic: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: MessageId::new(),
            topic: topic.into(),
            message_type: event.event_type().to_string(),
            key: event.business_key(),
            payload: serde_json::to_value(event)?,
            idempotency_key: None,
            published_at: Utc::now(),
        })
    }

    /// Builds the bus message for an outbox entry. The message keeps the
    /// outbox id so redeliveries are recognizable.
    pub fn from_outbox(message: &OutboxMessage) -> Self {
        Self {
            id: message.id,
            topic: message.topic.clone(),
            message_type: message.command_type.clone(),
            key: message.correlation_id.clone(),
            payload: message.payload.clone(),
            idempotency_key: Some(message.idempotency_key.clone()),
            published_at: Utc::now(),
        }
    }
}

/// Trait for event bus implementations.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a message to its topic.
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// Subscribes to a topic. Messages published after this call are delivered.
    fn subscribe(&self, topic: &str) -> BusSubscription;
}

/// Receiving end of a topic subscription.
pub struct BusSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusSubscription {
    /// Creates a subscription from a receiver.
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Returns the subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. Returns None once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Returns the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct InMemoryBusState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
    /// Kept only by recording buses.
    history: Option<Vec<BusMessage>>,
    failures_remaining: u32,
    unavailable: bool,
}

/// In-memory event bus for tests and local runs.
///
/// Fans every message out to all subscribers of its topic. A bus built with
/// [`InMemoryEventBus::recording`] also keeps the publish history.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<RwLock<InMemoryBusState>>,
}

impl InMemoryEventBus {
    /// Creates a new in-memory bus without publish history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus that keeps every published message for inspection.
    pub fn recording() -> Self {
        let bus = Self::default();
        bus.state.write().unwrap().history = Some(Vec::new());
        bus
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.write().unwrap().failures_remaining = count;
    }

    /// Makes every publish fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.write().unwrap().unavailable = unavailable;
    }

    /// Returns every message published so far. Empty unless recording.
    pub fn published(&self) -> Vec<BusMessage> {
        self.state.read().unwrap().history.clone().unwrap_or_default()
    }

    /// Returns the messages published to a topic.
    pub fn published_to(&self, topic: &str) -> Vec<BusMessage> {
        self.state
            .read()
            .unwrap()
            .history
            .iter()
            .flatten()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the type names of the messages published for a key, in order.
    pub fn published_types_for(&self, key: &BusinessKey) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .history
            .iter()
            .flatten()
            .filter(|m| &m.key == key)
            .map(|m| m.message_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let mut state = self.state.write().unwrap();

        if state.unavailable {
            return Err(BusError::Unavailable("bus marked unavailable".to_string()));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(BusError::Unavailable("injected publish failure".to_string()));
        }

        if let Some(subscribers) = state.subscribers.get_mut(&message.topic) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        if let Some(history) = state.history.as_mut() {
            history.push(message);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> BusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .write()
            .unwrap()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        BusSubscription::new(topic, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{FulfillmentEvent, fulfillment::EVENTS_TOPIC};

    fn message(topic: &str) -> BusMessage {
        BusMessage::event(topic, &FulfillmentEvent::payment_failed(1u64, "declined")).unwrap()
    }

    #[tokio::test]
    async fn fans_out_to_topic_subscribers() {
        let bus = InMemoryEventBus::recording();
        let mut a = bus.subscribe(EVENTS_TOPIC);
        let mut b = bus.subscribe(EVENTS_TOPIC);
        let mut other = bus.subscribe("payment.commands");

        bus.publish(message(EVENTS_TOPIC)).await.unwrap();

        assert_eq!(a.try_recv().unwrap().message_type, "PaymentFailed");
        assert!(b.try_recv().is_some());
        assert!(other.try_recv().is_none());
        assert_eq!(bus.published_to(EVENTS_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = InMemoryEventBus::recording();
        bus.fail_next_publishes(2);

        assert!(bus.publish(message(EVENTS_TOPIC)).await.is_err());
        assert!(bus.publish(message(EVENTS_TOPIC)).await.is_err());
        assert!(bus.publish(message(EVENTS_TOPIC)).await.is_ok());
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn default_bus_keeps_no_history() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(EVENTS_TOPIC);

        for _ in 0..3 {
            bus.publish(message(EVENTS_TOPIC)).await.unwrap();
        }

        assert_eq!(std::iter::from_fn(|| sub.try_recv()).count(), 3);
        assert!(bus.published().is_empty());
        assert!(bus.state.read().unwrap().history.is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe(EVENTS_TOPIC));

        bus.publish(message(EVENTS_TOPIC)).await.unwrap();
        assert!(
            bus.state.read().unwrap().subscribers[EVENTS_TOPIC].is_empty()
        );
    }

    #[test]
    fn event_message_carries_key_and_type() {
        let msg = message(EVENTS_TOPIC);
        assert_eq!(msg.key, BusinessKey::from("1"));
        assert_eq!(msg.payload["type"], "PaymentFailed");
        assert!(msg.idempotency_key.is_none());
    }
}
