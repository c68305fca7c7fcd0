use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BusinessKey, MessageId, OutboxMessage, Version};

/// The persisted form of a saga instance.
///
/// The store is workflow-agnostic: state is kept as its name and the
/// accumulated business data as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The saga type (e.g. "OrderFulfillment").
    pub saga_type: String,

    /// Business key the instance is correlated by.
    pub correlation_id: BusinessKey,

    /// Name of the current state.
    pub state: String,

    /// Version after the last accepted transition.
    pub version: Version,

    /// Business data accumulated across steps.
    pub data: serde_json::Value,

    /// True once the instance reached a terminal state.
    pub is_completed: bool,

    /// When the instance was first written.
    pub created_at: DateTime<Utc>,

    /// When the instance was last written.
    pub updated_at: DateTime<Utc>,
}

/// One audit entry per accepted transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub saga_type: String,
    pub correlation_id: BusinessKey,
    /// Version produced by the transition.
    pub version: Version,
    pub event_type: String,
    pub from_state: String,
    pub to_state: String,
    /// Inbound message that triggered the transition, if known.
    pub message_id: Option<MessageId>,
    pub recorded_at: DateTime<Utc>,
}

/// Everything a single accepted transition writes, committed atomically.
#[derive(Debug, Clone)]
pub struct TransitionWrite {
    pub saga_type: String,
    pub correlation_id: BusinessKey,
    /// Version the writer read; the write is rejected if the stored version differs.
    pub expected_version: Version,
    pub new_state: String,
    pub data: serde_json::Value,
    pub is_completed: bool,
    pub event_type: String,
    pub from_state: String,
    pub message_id: Option<MessageId>,
    pub outbox: Vec<OutboxMessage>,
}

impl TransitionWrite {
    /// Creates a write moving an instance from `from_state` to `new_state`.
    pub fn new(
        saga_type: impl Into<String>,
        correlation_id: BusinessKey,
        expected_version: Version,
        from_state: impl Into<String>,
        new_state: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            saga_type: saga_type.into(),
            correlation_id,
            expected_version,
            new_state: new_state.into(),
            data,
            is_completed: false,
            event_type: String::new(),
            from_state: from_state.into(),
            message_id: None,
            outbox: Vec::new(),
        }
    }

    /// Records which event caused the transition.
    pub fn caused_by(mut self, event_type: impl Into<String>, message_id: Option<MessageId>) -> Self {
        self.event_type = event_type.into();
        self.message_id = message_id;
        self
    }

    /// Marks the new state as terminal.
    pub fn completed(mut self, is_completed: bool) -> Self {
        self.is_completed = is_completed;
        self
    }

    /// Attaches the outbound commands emitted by the transition.
    pub fn with_outbox(mut self, outbox: Vec<OutboxMessage>) -> Self {
        self.outbox = outbox;
        self
    }

    /// Returns the version the instance will have once the write is applied.
    pub fn new_version(&self) -> Version {
        self.expected_version.next()
    }

    /// Builds the transition log entry for this write.
    pub fn log_entry(&self, recorded_at: DateTime<Utc>) -> TransitionLogEntry {
        TransitionLogEntry {
            saga_type: self.saga_type.clone(),
            correlation_id: self.correlation_id.clone(),
            version: self.new_version(),
            event_type: self.event_type.clone(),
            from_state: self.from_state.clone(),
            to_state: self.new_state.clone(),
            message_id: self.message_id,
            recorded_at,
        }
    }
}

/// Result of [`SagaStore::try_apply_transition`](crate::SagaStore::try_apply_transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The write was committed; the instance is now at `version`.
    Applied { version: Version },

    /// Another writer advanced the instance first. Nothing was written.
    VersionConflict { expected: Version, actual: Version },
}

impl ApplyOutcome {
    /// Returns true if the write was committed.
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}
