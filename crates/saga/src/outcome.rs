//! Outcomes of handling one inbound event.

use domain::Rejection;
use saga_store::Version;

/// What the engine did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A transition was committed.
    Applied {
        from: &'static str,
        to: &'static str,
        version: Version,
        commands: usize,
    },

    /// Redelivered start event for an existing instance. Nothing changed.
    Duplicate,

    /// Redelivered start event whose payload disagrees with the stored
    /// instance. Recorded for an operator.
    DataConflict { reason: String },

    /// Continuing event for a business key with no instance. Dead-lettered.
    Orphaned,

    /// The event is not applicable to the current state.
    Ignored { state: &'static str, rejection: Rejection },

    /// A compensation failed downstream. Escalated to an operator.
    Escalated { command_type: String },
}

impl HandleOutcome {
    /// Returns true if a transition was committed.
    pub fn is_applied(&self) -> bool {
        matches!(self, HandleOutcome::Applied { .. })
    }

    /// Returns the outcome name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleOutcome::Applied { .. } => "applied",
            HandleOutcome::Duplicate => "duplicate",
            HandleOutcome::DataConflict { .. } => "data_conflict",
            HandleOutcome::Orphaned => "orphaned",
            HandleOutcome::Ignored { .. } => "ignored",
            HandleOutcome::Escalated { .. } => "escalated",
        }
    }
}
