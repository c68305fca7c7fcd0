//! Dead letters and the operator queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BusinessKey, MessageId};

/// Why a message ended up in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterKind {
    /// A continuing event arrived for a business key with no saga instance.
    OrphanedEvent,

    /// An inbound message could not be decoded into a workflow event.
    UndecodableMessage,

    /// A duplicate start event carried a payload that disagrees with the stored instance.
    DataConflict,

    /// Version conflicts persisted past the retry budget.
    TransientPersistenceFailure,

    /// A compensating command could not be applied downstream.
    CompensationFailure,

    /// An outbound command could not be published after repeated attempts.
    UndeliverableCommand,
}

impl DeadLetterKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::OrphanedEvent => "OrphanedEvent",
            DeadLetterKind::UndecodableMessage => "UndecodableMessage",
            DeadLetterKind::DataConflict => "DataConflict",
            DeadLetterKind::TransientPersistenceFailure => "TransientPersistenceFailure",
            DeadLetterKind::CompensationFailure => "CompensationFailure",
            DeadLetterKind::UndeliverableCommand => "UndeliverableCommand",
        }
    }

    /// Parses a kind name produced by [`DeadLetterKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OrphanedEvent" => Some(DeadLetterKind::OrphanedEvent),
            "UndecodableMessage" => Some(DeadLetterKind::UndecodableMessage),
            "DataConflict" => Some(DeadLetterKind::DataConflict),
            "TransientPersistenceFailure" => Some(DeadLetterKind::TransientPersistenceFailure),
            "CompensationFailure" => Some(DeadLetterKind::CompensationFailure),
            "UndeliverableCommand" => Some(DeadLetterKind::UndeliverableCommand),
            _ => None,
        }
    }

    /// Returns true if an operator has to look at entries of this kind.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            DeadLetterKind::DataConflict
                | DeadLetterKind::TransientPersistenceFailure
                | DeadLetterKind::CompensationFailure
        )
    }
}

impl std::fmt::Display for DeadLetterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message that could not be processed normally, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: MessageId,
    pub kind: DeadLetterKind,
    pub saga_type: String,
    pub correlation_id: Option<BusinessKey>,
    pub event_type: Option<String>,
    pub payload: serde_json::Value,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead letter with no correlation or payload attached.
    pub fn new(kind: DeadLetterKind, saga_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            saga_type: saga_type.into(),
            correlation_id: None,
            event_type: None,
            payload: serde_json::Value::Null,
            error: error.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Attaches the business key the message referred to.
    pub fn with_correlation(mut self, correlation_id: BusinessKey) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attaches the message type and its raw payload.
    pub fn with_message(mut self, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        self.event_type = Some(event_type.into());
        self.payload = payload;
        self
    }
}
