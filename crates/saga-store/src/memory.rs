use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    ApplyOutcome, BusinessKey, DeadLetter, DeadLetterQuery, MessageId, OutboxMessage,
    OutboxStatus, Result, SagaRecord, StoreError, TransitionLogEntry, TransitionWrite, Version,
    store::{SagaStore, validate_transition_write},
};

type InstanceKey = (String, BusinessKey);

#[derive(Debug, Default)]
struct Inner {
    instances: HashMap<InstanceKey, SagaRecord>,
    transitions: Vec<TransitionLogEntry>,
    outbox: Vec<OutboxMessage>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory saga store for tests and local runs.
///
/// A single write lock covers instances, log and outbox, so every
/// `try_apply_transition` is atomic exactly like the PostgreSQL transaction.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored saga instances.
    pub async fn instance_count(&self) -> usize {
        self.inner.read().await.instances.len()
    }

    /// Returns the total number of outbox messages, whatever their status.
    pub async fn outbox_len(&self) -> usize {
        self.inner.read().await.outbox.len()
    }

    /// Clears all stored data.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.instances.clear();
        inner.transitions.clear();
        inner.outbox.clear();
        inner.dead_letters.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Option<SagaRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .get(&(saga_type.to_string(), correlation_id.clone()))
            .cloned())
    }

    async fn try_apply_transition(&self, write: TransitionWrite) -> Result<ApplyOutcome> {
        validate_transition_write(&write)?;

        let key = (write.saga_type.clone(), write.correlation_id.clone());
        let mut inner = self.inner.write().await;

        let current = inner
            .instances
            .get(&key)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if current != write.expected_version {
            return Ok(ApplyOutcome::VersionConflict {
                expected: write.expected_version,
                actual: current,
            });
        }

        let now = Utc::now();
        let new_version = write.new_version();
        let created_at = inner
            .instances
            .get(&key)
            .map(|r| r.created_at)
            .unwrap_or(now);

        let entry = write.log_entry(now);
        inner.instances.insert(
            key,
            SagaRecord {
                saga_type: write.saga_type,
                correlation_id: write.correlation_id,
                state: write.new_state,
                version: new_version,
                data: write.data,
                is_completed: write.is_completed,
                created_at,
                updated_at: now,
            },
        );
        inner.transitions.push(entry);

        for message in write.outbox {
            // Unique idempotency key, same as the SQL constraint
            let duplicate = inner
                .outbox
                .iter()
                .any(|m| m.idempotency_key == message.idempotency_key);
            if !duplicate {
                inner.outbox.push(message);
            }
        }

        Ok(ApplyOutcome::Applied {
            version: new_version,
        })
    }

    async fn transition_log(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Vec<TransitionLogEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<_> = inner
            .transitions
            .iter()
            .filter(|e| e.saga_type == saga_type && &e.correlation_id == correlation_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    async fn outbox_for(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Vec<OutboxMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|m| m.saga_type == saga_type && &m.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|m| m.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, id: MessageId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::OutboxMessageNotFound(id))?;

        message.status = OutboxStatus::Dispatched;
        message.dispatched_at = Some(Utc::now());
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        id: MessageId,
        error: &str,
        give_up: bool,
    ) -> Result<OutboxMessage> {
        let mut inner = self.inner.write().await;
        let message = inner
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::OutboxMessageNotFound(id))?;

        message.attempts += 1;
        message.last_error = Some(error.to_string());
        if give_up {
            message.status = OutboxStatus::Failed;
        }
        Ok(message.clone())
    }

    async fn record_dead_letter(&self, letter: DeadLetter) -> Result<()> {
        self.inner.write().await.dead_letters.push(letter);
        Ok(())
    }

    async fn dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        let inner = self.inner.read().await;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        Ok(inner
            .dead_letters
            .iter()
            .filter(|l| query.matches(l))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
