//! Saga error types.

use common::BusinessKey;
use saga_store::StoreError;
use thiserror::Error;

use crate::bus::BusError;

/// Errors that can occur during saga operations.
///
/// Conditions the engine resolves on its own (duplicates, orphans, invalid
/// transitions) are reported as [`HandleOutcome`](crate::HandleOutcome)s,
/// not errors.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Version conflicts kept happening past the retry budget.
    #[error(
        "Transient persistence failure: {saga_type} {correlation_id} still conflicting after {attempts} attempts"
    )]
    TransientPersistenceFailure {
        saga_type: &'static str,
        correlation_id: BusinessKey,
        attempts: u32,
    },

    /// A stored state name is not part of the workflow.
    #[error("Corrupt saga state for {correlation_id}: unknown state '{state}'")]
    CorruptState {
        correlation_id: BusinessKey,
        state: String,
    },

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event bus error.
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    /// Inventory service error.
    #[error("Inventory service error: {0}")]
    InventoryService(String),

    /// Payment service error.
    #[error("Payment service error: {0}")]
    PaymentService(String),

    /// Shipping service error.
    #[error("Shipping service error: {0}")]
    ShippingService(String),

    /// A command type no downstream participant handles.
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
