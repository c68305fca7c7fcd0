//! Outbox relay: the only publisher of saga commands.
//!
//! Commands become visible on the bus only after the transition that emitted
//! them is committed. The relay publishes pending outbox entries in write
//! order and marks them dispatched. A crash between publish and mark means
//! the command is published again, which downstream idempotency absorbs.

use std::collections::HashSet;
use std::time::Duration;

use common::BusinessKey;
use saga_store::{DeadLetter, DeadLetterKind, OutboxMessage, SagaStore};
use tokio::sync::watch;

use crate::bus::{BusMessage, EventBus};
use crate::error::Result;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of entries fetched per poll.
    pub batch_size: usize,

    /// Pause between polls.
    pub poll_interval: Duration,

    /// Failed publishes after which an entry is abandoned.
    pub max_dispatch_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(200),
            max_dispatch_attempts: 5,
        }
    }
}

/// Counts from one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub dispatched: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Entries held back because an earlier entry of the same key failed.
    pub deferred: usize,
}

/// Publishes committed outbox entries to the bus.
pub struct OutboxRelay<S, B>
where
    S: SagaStore,
    B: EventBus,
{
    store: S,
    bus: B,
    config: RelayConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: SagaStore,
    B: EventBus,
{
    /// Creates a relay with the default configuration.
    pub fn new(store: S, bus: B) -> Self {
        Self::with_config(store, bus, RelayConfig::default())
    }

    /// Creates a relay with a custom configuration.
    pub fn with_config(store: S, bus: B, config: RelayConfig) -> Self {
        Self { store, bus, config }
    }

    /// Publishes one batch of pending entries.
    ///
    /// Entries of a key whose earlier entry failed in this pass are left
    /// pending, so per-key command order is kept.
    #[tracing::instrument(skip(self))]
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let pending = self.store.pending_outbox(self.config.batch_size).await?;
        let mut report = RelayReport::default();
        let mut blocked: HashSet<BusinessKey> = HashSet::new();

        for message in pending {
            if blocked.contains(&message.correlation_id) {
                report.deferred += 1;
                continue;
            }

            match self.bus.publish(BusMessage::from_outbox(&message)).await {
                Ok(()) => {
                    self.store.mark_dispatched(message.id).await?;
                    metrics::counter!(
                        "saga_outbox_dispatched_total",
                        "command_type" => message.command_type.clone()
                    )
                    .increment(1);
                    report.dispatched += 1;
                }
                Err(e) => {
                    blocked.insert(message.correlation_id.clone());
                    if self.record_failure(&message, &e.to_string()).await? {
                        report.abandoned += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report != RelayReport::default() {
            tracing::debug!(
                dispatched = report.dispatched,
                failed = report.failed,
                abandoned = report.abandoned,
                deferred = report.deferred,
                "outbox relay pass"
            );
        }
        Ok(report)
    }

    /// Polls until `shutdown` changes or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox relay started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.relay_once().await {
                        tracing::error!(error = %e, "outbox relay pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("outbox relay stopped");
    }

    /// Records a failed publish. Returns true if the entry was abandoned.
    async fn record_failure(&self, message: &OutboxMessage, error: &str) -> Result<bool> {
        let give_up = message.attempts + 1 >= self.config.max_dispatch_attempts;
        let updated = self
            .store
            .record_dispatch_failure(message.id, error, give_up)
            .await?;
        metrics::counter!(
            "saga_outbox_dispatch_failures_total",
            "command_type" => message.command_type.clone()
        )
        .increment(1);

        if !give_up {
            tracing::warn!(
                correlation_id = %message.correlation_id,
                command_type = %message.command_type,
                attempts = updated.attempts,
                error,
                "command publish failed, will retry"
            );
            return Ok(false);
        }

        let kind = if message.is_compensation {
            metrics::counter!(
                "saga_compensation_failures_total",
                "saga_type" => message.saga_type.clone(),
                "source" => "relay"
            )
            .increment(1);
            DeadLetterKind::CompensationFailure
        } else {
            DeadLetterKind::UndeliverableCommand
        };
        tracing::error!(
            correlation_id = %message.correlation_id,
            command_type = %message.command_type,
            attempts = updated.attempts,
            error,
            %kind,
            "command abandoned after repeated publish failures"
        );

        let letter = DeadLetter::new(
            kind,
            message.saga_type.clone(),
            format!("publish failed {} times: {error}", updated.attempts),
        )
        .with_correlation(message.correlation_id.clone())
        .with_message(message.command_type.clone(), message.payload.clone());
        self.store.record_dead_letter(letter).await?;
        Ok(true)
    }
}
