//! Inbound event envelope.

use chrono::{DateTime, Utc};
use common::MessageId;
use domain::WorkflowEvent;

use crate::bus::BusMessage;

/// An event as delivered to the engine.
#[derive(Debug, Clone)]
pub struct InboundEvent<E> {
    /// Delivery id, recorded in the transition log.
    pub message_id: MessageId,
    pub received_at: DateTime<Utc>,
    pub event: E,
}

impl<E: WorkflowEvent> InboundEvent<E> {
    /// Wraps an event with a fresh message id.
    pub fn new(event: E) -> Self {
        Self {
            message_id: MessageId::new(),
            received_at: Utc::now(),
            event,
        }
    }

    /// Sets the message id, e.g. to replay the exact same delivery.
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Decodes a bus message into an event envelope.
    pub fn decode(message: &BusMessage) -> Result<Self, serde_json::Error> {
        let event: E = serde_json::from_value(message.payload.clone())?;
        Ok(Self {
            message_id: message.id,
            received_at: Utc::now(),
            event,
        })
    }
}
