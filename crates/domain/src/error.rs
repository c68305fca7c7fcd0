//! Domain error types.

use thiserror::Error;

/// A transition guard rejected an event.
///
/// Guard violations are never retried: the event is acknowledged and the
/// instance is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    /// A write-once field already holds a different value.
    #[error("Field '{field}' is already set to a different value")]
    FieldFrozen { field: &'static str },

    /// The amount reported by a step does not match the order amount.
    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: String, actual: String },

    /// A timeout was raised for a state the instance has already left.
    #[error("Stale timeout: raised for {awaiting}, instance is in {current}")]
    StaleTimeout { awaiting: String, current: String },

    /// Data required by the transition was never recorded.
    #[error("Missing field: {field}")]
    MissingField { field: &'static str },

    /// The transition function was routed an event of another type.
    #[error("Transition for {expected} received {actual}")]
    EventMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}
