use async_trait::async_trait;

use crate::{
    ApplyOutcome, BusinessKey, DeadLetter, DeadLetterQuery, MessageId, OutboxMessage, Result,
    SagaRecord, StoreError, TransitionLogEntry, TransitionWrite,
};

/// Core trait for saga store implementations.
///
/// `try_apply_transition` is the sole mutation path for saga state. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads the instance of `saga_type` correlated by `correlation_id`.
    ///
    /// Returns None if no instance has been written for the key.
    async fn load(&self, saga_type: &str, correlation_id: &BusinessKey)
    -> Result<Option<SagaRecord>>;

    /// Atomically writes a transition: new state and data, the transition log
    /// entry and every outbox message of the write.
    ///
    /// The write only applies if the stored version equals
    /// `write.expected_version` (`Version::initial()` means "must not exist").
    /// Otherwise nothing is written and `VersionConflict` is returned.
    async fn try_apply_transition(&self, write: TransitionWrite) -> Result<ApplyOutcome>;

    /// Returns the transition log of an instance, oldest first.
    async fn transition_log(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Vec<TransitionLogEntry>>;

    /// Returns every outbox message emitted by an instance, oldest first.
    async fn outbox_for(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Vec<OutboxMessage>>;

    /// Returns up to `limit` pending outbox messages in the order they were written.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks an outbox message as published.
    async fn mark_dispatched(&self, id: MessageId) -> Result<()>;

    /// Records a failed publish attempt. With `give_up` the message is marked
    /// Failed and no longer returned by `pending_outbox`.
    ///
    /// Returns the updated message.
    async fn record_dispatch_failure(
        &self,
        id: MessageId,
        error: &str,
        give_up: bool,
    ) -> Result<OutboxMessage>;

    /// Stores a dead letter.
    async fn record_dead_letter(&self, letter: DeadLetter) -> Result<()>;

    /// Retrieves dead letters matching a query, oldest first.
    async fn dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Checks if an instance exists for the key.
    async fn instance_exists(&self, saga_type: &str, correlation_id: &BusinessKey) -> Result<bool> {
        Ok(self.load(saga_type, correlation_id).await?.is_some())
    }

    /// Returns the entries an operator has to act on.
    async fn operator_queue(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.dead_letters(DeadLetterQuery::operator_queue().limit(limit))
            .await
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Validates a transition write before it reaches storage.
pub fn validate_transition_write(write: &TransitionWrite) -> Result<()> {
    if write.new_state.is_empty() {
        return Err(StoreError::InvalidWrite("new state is empty".to_string()));
    }
    if write.correlation_id.is_empty() {
        return Err(StoreError::InvalidWrite(
            "correlation id is empty".to_string(),
        ));
    }

    let new_version = write.new_version();
    for message in &write.outbox {
        if message.correlation_id != write.correlation_id || message.saga_type != write.saga_type
        {
            return Err(StoreError::InvalidWrite(format!(
                "outbox message {} belongs to another saga instance",
                message.id
            )));
        }
        if message.saga_version != new_version {
            return Err(StoreError::InvalidWrite(format!(
                "outbox message {} carries version {}, expected {}",
                message.id, message.saga_version, new_version
            )));
        }
    }

    Ok(())
}
