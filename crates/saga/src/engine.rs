//! Saga engine: correlates inbound events to instances and applies transitions.

use std::time::{Duration, Instant};

use common::BusinessKey;
use domain::{Decision, SagaState, Step, Workflow, WorkflowCommand, WorkflowEvent};
use saga_store::{
    ApplyOutcome, DeadLetter, DeadLetterKind, OutboxMessage, SagaStore, TransitionLogEntry,
    TransitionWrite,
};

use crate::dispatch::KeyedLocks;
use crate::envelope::InboundEvent;
use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::outcome::HandleOutcome;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often a transition is re-decided after a version conflict before
    /// giving up with a transient persistence failure.
    /// Also bounds how often an event is retried after a store error.
    pub max_write_attempts: u32,
    /// Pause before the first retry after a store error; grows linearly.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 5,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

/// Applies inbound events to saga instances of one workflow.
///
/// Each event is handled under its business key's lock: load, decide, then a
/// single conditional write of state, data, log entry and outbox. A version
/// conflict means another writer got there first; the engine re-reads and
/// decides again against the new state.
pub struct SagaEngine<S, W>
where
    S: SagaStore,
    W: Workflow,
{
    store: S,
    workflow: W,
    locks: KeyedLocks,
    config: EngineConfig,
}

impl<S, W> SagaEngine<S, W>
where
    S: SagaStore,
    W: Workflow,
{
    /// Creates an engine with the default configuration.
    pub fn new(store: S, workflow: W) -> Self {
        Self::with_config(store, workflow, EngineConfig::default())
    }

    /// Creates an engine with a custom configuration.
    pub fn with_config(store: S, workflow: W, config: EngineConfig) -> Self {
        Self {
            store,
            workflow,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the workflow.
    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    /// Returns the number of business keys with an event in flight.
    pub fn active_keys(&self) -> usize {
        self.locks.active_keys()
    }

    /// Loads the instance correlated by `key`.
    pub async fn load(&self, key: &BusinessKey) -> Result<Option<SagaInstance<W>>> {
        self.store
            .load(W::SAGA_TYPE, key)
            .await?
            .map(SagaInstance::from_record)
            .transpose()
    }

    /// Returns the transition log of the instance correlated by `key`.
    pub async fn transition_log(&self, key: &BusinessKey) -> Result<Vec<TransitionLogEntry>> {
        Ok(self.store.transition_log(W::SAGA_TYPE, key).await?)
    }

    /// Handles one delivery of an inbound event.
    ///
    /// Safe to call any number of times with the same event: redeliveries
    /// resolve to `Duplicate` or `Ignored` without writing anything.
    ///
    /// Store errors are retried with backoff up to `max_write_attempts`.
    /// After that the event is dead-lettered as a transient persistence
    /// failure and the store error is returned.
    #[tracing::instrument(
        skip(self, inbound),
        fields(
            saga_type = W::SAGA_TYPE,
            correlation_id = %inbound.event.business_key(),
            event_type = inbound.event.event_type(),
        )
    )]
    pub async fn handle(&self, inbound: InboundEvent<W::Event>) -> Result<HandleOutcome> {
        let key = inbound.event.business_key();
        let event_type = inbound.event.event_type();
        metrics::counter!("saga_events_total", "saga_type" => W::SAGA_TYPE, "event_type" => event_type)
            .increment(1);
        let started = Instant::now();

        let _guard = self.locks.lock(&key).await;
        let result = self.handle_with_retry(&key, &inbound).await;

        metrics::histogram!("saga_handle_duration_seconds", "saga_type" => W::SAGA_TYPE)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Records a message that could not be decoded into a workflow event.
    pub async fn record_undecodable(
        &self,
        key: Option<BusinessKey>,
        message_type: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<()> {
        tracing::warn!(
            saga_type = W::SAGA_TYPE,
            message_type,
            error,
            "undecodable message dead-lettered"
        );
        let mut letter = DeadLetter::new(DeadLetterKind::UndecodableMessage, W::SAGA_TYPE, error)
            .with_message(message_type, payload);
        if let Some(key) = key {
            letter = letter.with_correlation(key);
        }
        self.store.record_dead_letter(letter).await?;
        Ok(())
    }

    async fn handle_with_retry(
        &self,
        key: &BusinessKey,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<HandleOutcome> {
        let mut attempt = 1;
        loop {
            match self.handle_locked(key, inbound).await {
                Err(SagaError::Store(e)) if attempt < self.config.max_write_attempts => {
                    tracing::warn!(attempt, error = %e, "store error, retrying event");
                    metrics::counter!("saga_store_retries_total", "saga_type" => W::SAGA_TYPE)
                        .increment(1);
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(SagaError::Store(e)) => return self.store_exhausted(key, inbound, e).await,
                result => return result,
            }
        }
    }

    async fn handle_locked(
        &self,
        key: &BusinessKey,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<HandleOutcome> {
        let event = &inbound.event;

        if let Some(report) = self.workflow.compensation_failure(event) {
            if self.store.load(W::SAGA_TYPE, key).await?.is_none() {
                return self.orphaned(key, inbound).await;
            }
            return self
                .escalate_compensation_failure(key, inbound, report)
                .await;
        }

        let is_start = self.workflow.is_start_event(event);

        for attempt in 1..=self.config.max_write_attempts {
            let instance = match self.store.load(W::SAGA_TYPE, key).await? {
                None if is_start => SagaInstance::fresh(&self.workflow, key.clone()),
                None => return self.orphaned(key, inbound).await,
                Some(record) => {
                    let instance = SagaInstance::<W>::from_record(record)?;
                    if is_start {
                        return self.duplicate_start(&instance, inbound).await;
                    }
                    instance
                }
            };

            let step = match self
                .workflow
                .transitions()
                .decide(instance.state, &instance.data, event)
            {
                Decision::Apply(step) => step,
                Decision::Ignore(rejection) => {
                    tracing::warn!(
                        state = %instance.state,
                        %rejection,
                        "event not applicable, acknowledged without change"
                    );
                    metrics::counter!(
                        "saga_events_ignored_total",
                        "saga_type" => W::SAGA_TYPE,
                        "event_type" => event.event_type()
                    )
                    .increment(1);
                    return Ok(HandleOutcome::Ignored {
                        state: instance.state.as_str(),
                        rejection,
                    });
                }
            };

            let from = instance.state.as_str();
            let to = step.to.as_str();
            let commands = step.commands.len();
            let write = self.build_write(&instance, step, inbound)?;

            match self.store.try_apply_transition(write).await? {
                ApplyOutcome::Applied { version } => {
                    tracing::info!(from, to, %version, commands, "saga transition applied");
                    metrics::counter!(
                        "saga_transitions_total",
                        "saga_type" => W::SAGA_TYPE,
                        "from" => from,
                        "to" => to
                    )
                    .increment(1);
                    return Ok(HandleOutcome::Applied {
                        from,
                        to,
                        version,
                        commands,
                    });
                }
                ApplyOutcome::VersionConflict { expected, actual } => {
                    tracing::debug!(attempt, %expected, %actual, "version conflict, re-reading");
                    metrics::counter!("saga_version_conflicts_total", "saga_type" => W::SAGA_TYPE)
                        .increment(1);
                }
            }
        }

        self.persistence_exhausted(key, inbound).await
    }

    fn build_write(
        &self,
        instance: &SagaInstance<W>,
        step: Step<W>,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<TransitionWrite> {
        let new_version = instance.version.next();
        let outbox = step
            .commands
            .iter()
            .map(|command| -> Result<OutboxMessage> {
                Ok(OutboxMessage::pending(
                    W::SAGA_TYPE,
                    instance.correlation_id.clone(),
                    new_version,
                    command.command_type(),
                    command.topic(),
                    serde_json::to_value(command)?,
                    command.is_compensation(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TransitionWrite::new(
            W::SAGA_TYPE,
            instance.correlation_id.clone(),
            instance.version,
            instance.state.as_str(),
            step.to.as_str(),
            serde_json::to_value(&step.data)?,
        )
        .caused_by(inbound.event.event_type(), Some(inbound.message_id))
        .completed(step.to.is_terminal())
        .with_outbox(outbox))
    }

    async fn duplicate_start(
        &self,
        instance: &SagaInstance<W>,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<HandleOutcome> {
        match self.workflow.start_conflict(&instance.data, &inbound.event) {
            None => {
                tracing::debug!(state = %instance.state, "duplicate start event ignored");
                metrics::counter!("saga_duplicate_starts_total", "saga_type" => W::SAGA_TYPE)
                    .increment(1);
                Ok(HandleOutcome::Duplicate)
            }
            Some(reason) => {
                tracing::error!(state = %instance.state, %reason, "start event conflicts with stored instance");
                metrics::counter!("saga_data_conflicts_total", "saga_type" => W::SAGA_TYPE)
                    .increment(1);
                let letter = self
                    .letter(DeadLetterKind::DataConflict, &reason, inbound)?
                    .with_correlation(instance.correlation_id.clone());
                self.store.record_dead_letter(letter).await?;
                Ok(HandleOutcome::DataConflict { reason })
            }
        }
    }

    async fn orphaned(
        &self,
        key: &BusinessKey,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<HandleOutcome> {
        tracing::warn!("no saga instance for continuing event, dead-lettered");
        metrics::counter!("saga_orphaned_events_total", "saga_type" => W::SAGA_TYPE).increment(1);

        let letter = self
            .letter(
                DeadLetterKind::OrphanedEvent,
                "no saga instance for business key",
                inbound,
            )?
            .with_correlation(key.clone());
        self.store.record_dead_letter(letter).await?;
        Ok(HandleOutcome::Orphaned)
    }

    async fn escalate_compensation_failure(
        &self,
        key: &BusinessKey,
        inbound: &InboundEvent<W::Event>,
        report: domain::CompensationFailureReport,
    ) -> Result<HandleOutcome> {
        tracing::error!(
            command_type = %report.command_type,
            reason = %report.reason,
            "compensation failed downstream, operator action required"
        );
        metrics::counter!(
            "saga_compensation_failures_total",
            "saga_type" => W::SAGA_TYPE,
            "source" => "downstream"
        )
        .increment(1);

        let error = format!("{} failed: {}", report.command_type, report.reason);
        let letter = self
            .letter(DeadLetterKind::CompensationFailure, &error, inbound)?
            .with_correlation(key.clone());
        self.store.record_dead_letter(letter).await?;
        Ok(HandleOutcome::Escalated {
            command_type: report.command_type,
        })
    }

    async fn persistence_exhausted(
        &self,
        key: &BusinessKey,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<HandleOutcome> {
        let attempts = self.config.max_write_attempts;
        tracing::error!(attempts, "version conflicts exhausted the retry budget");
        metrics::counter!("saga_persistence_failures_total", "saga_type" => W::SAGA_TYPE)
            .increment(1);

        let error = format!("still conflicting after {attempts} attempts");
        let letter = self
            .letter(DeadLetterKind::TransientPersistenceFailure, &error, inbound)?
            .with_correlation(key.clone());
        self.store.record_dead_letter(letter).await?;

        Err(SagaError::TransientPersistenceFailure {
            saga_type: W::SAGA_TYPE,
            correlation_id: key.clone(),
            attempts,
        })
    }

    async fn store_exhausted(
        &self,
        key: &BusinessKey,
        inbound: &InboundEvent<W::Event>,
        error: saga_store::StoreError,
    ) -> Result<HandleOutcome> {
        let attempts = self.config.max_write_attempts;
        tracing::error!(attempts, %error, "store errors exhausted the retry budget");
        metrics::counter!("saga_persistence_failures_total", "saga_type" => W::SAGA_TYPE)
            .increment(1);

        let reason = format!("store error after {attempts} attempts: {error}");
        let letter = self
            .letter(DeadLetterKind::TransientPersistenceFailure, &reason, inbound)?
            .with_correlation(key.clone());
        if let Err(e) = self.store.record_dead_letter(letter).await {
            tracing::error!(error = %e, "could not dead-letter event after store errors");
        }

        Err(SagaError::Store(error))
    }

    fn letter(
        &self,
        kind: DeadLetterKind,
        error: &str,
        inbound: &InboundEvent<W::Event>,
    ) -> Result<DeadLetter> {
        Ok(DeadLetter::new(kind, W::SAGA_TYPE, error).with_message(
            inbound.event.event_type(),
            serde_json::to_value(&inbound.event)?,
        ))
    }
}
