//! Transactional outbox entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BusinessKey, MessageId, Version};

/// Delivery status of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OutboxStatus {
    /// Written with the saga transition, not yet published.
    #[default]
    Pending,

    /// Published to the bus.
    Dispatched,

    /// Publishing was abandoned after too many attempts.
    Failed,
}

impl OutboxStatus {
    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "Pending",
            OutboxStatus::Dispatched => "Dispatched",
            OutboxStatus::Failed => "Failed",
        }
    }

    /// Parses a status name produced by [`OutboxStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(OutboxStatus::Pending),
            "Dispatched" => Some(OutboxStatus::Dispatched),
            "Failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An outbound command recorded atomically with the saga transition that emitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Unique identifier of this outbox entry.
    pub id: MessageId,

    /// The saga type that emitted the command.
    pub saga_type: String,

    /// Business key of the emitting saga instance.
    pub correlation_id: BusinessKey,

    /// Saga version produced by the emitting transition.
    pub saga_version: Version,

    /// Command type (e.g. "ReserveInventory").
    pub command_type: String,

    /// Bus topic the command is published to.
    pub topic: String,

    /// The serialized command.
    pub payload: serde_json::Value,

    /// Key downstream consumers use to drop duplicate deliveries.
    pub idempotency_key: String,

    /// True if the command undoes a previously completed step.
    pub is_compensation: bool,

    /// Delivery status.
    pub status: OutboxStatus,

    /// Number of failed publish attempts.
    pub attempts: u32,

    /// Error from the last failed publish attempt.
    pub last_error: Option<String>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,

    /// When the entry was published.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Creates a pending outbox entry.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        saga_type: impl Into<String>,
        correlation_id: BusinessKey,
        saga_version: Version,
        command_type: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        is_compensation: bool,
    ) -> Self {
        let saga_type = saga_type.into();
        let command_type = command_type.into();
        let idempotency_key =
            Self::idempotency_key_for(&saga_type, &correlation_id, saga_version, &command_type);

        Self {
            id: MessageId::new(),
            saga_type,
            correlation_id,
            saga_version,
            command_type,
            topic: topic.into(),
            payload,
            idempotency_key,
            is_compensation,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            dispatched_at: None,
        }
    }

    /// Builds the idempotency key `{saga_type}:{key}:{version}:{command_type}`.
    ///
    /// The key is stable across redeliveries of the event that produced the
    /// command, because the same transition always yields the same version.
    pub fn idempotency_key_for(
        saga_type: &str,
        correlation_id: &BusinessKey,
        saga_version: Version,
        command_type: &str,
    ) -> String {
        format!("{saga_type}:{correlation_id}:{saga_version}:{command_type}")
    }

    /// Returns true if the entry still needs to be published.
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }
}
