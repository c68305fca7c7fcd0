use thiserror::Error;

use crate::MessageId;

/// Errors that can occur when interacting with the saga store.
///
/// Version conflicts are not errors: they are reported through
/// [`ApplyOutcome::VersionConflict`](crate::ApplyOutcome::VersionConflict).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transition write was malformed (e.g. outbox rows for another saga).
    #[error("Invalid transition write: {0}")]
    InvalidWrite(String),

    /// The referenced outbox message does not exist.
    #[error("Outbox message not found: {0}")]
    OutboxMessageNotFound(MessageId),

    /// A stored column held a value this version of the store cannot read.
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
