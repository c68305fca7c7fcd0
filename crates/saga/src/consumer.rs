//! Event consumer feeding the engine from the bus.
//!
//! Messages are partitioned by business key onto a fixed set of workers, so
//! events of one key are handled in arrival order while different keys run
//! in parallel.

use std::sync::Arc;

use futures_util::future::join_all;
use saga_store::SagaStore;
use tokio::sync::{mpsc, watch};

use domain::Workflow;

use crate::bus::{BusMessage, BusSubscription};
use crate::dispatch::partition_for;
use crate::engine::SagaEngine;
use crate::envelope::InboundEvent;
use crate::error::Result;
use crate::outcome::HandleOutcome;

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of partition workers.
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Decodes bus messages and hands them to a [`SagaEngine`].
pub struct SagaConsumer<S, W>
where
    S: SagaStore + 'static,
    W: Workflow,
{
    engine: Arc<SagaEngine<S, W>>,
    config: ConsumerConfig,
}

impl<S, W> SagaConsumer<S, W>
where
    S: SagaStore + 'static,
    W: Workflow,
{
    pub fn new(engine: Arc<SagaEngine<S, W>>) -> Self {
        Self::with_config(engine, ConsumerConfig::default())
    }

    pub fn with_config(engine: Arc<SagaEngine<S, W>>, config: ConsumerConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<SagaEngine<S, W>> {
        &self.engine
    }

    /// Handles one message. Undecodable messages are dead-lettered and
    /// yield `None`.
    pub async fn handle_message(&self, message: &BusMessage) -> Result<Option<HandleOutcome>> {
        process(&self.engine, message).await
    }

    /// Handles every message already queued on `subscription`, in order.
    /// Returns how many were handled.
    pub async fn drain(&self, subscription: &mut BusSubscription) -> Result<usize> {
        let mut handled = 0;
        while let Some(message) = subscription.try_recv() {
            self.handle_message(&message).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Consumes `subscription` until `shutdown` changes or the bus closes.
    ///
    /// Queued messages already handed to a worker are finished before
    /// returning.
    pub async fn run(&self, mut subscription: BusSubscription, mut shutdown: watch::Receiver<bool>) {
        let workers = self.config.workers.max(1);
        tracing::info!(
            saga_type = W::SAGA_TYPE,
            topic = subscription.topic(),
            workers,
            "saga consumer started"
        );

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for partition in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(tokio::spawn(worker(
                partition,
                Arc::clone(&self.engine),
                rx,
            )));
        }

        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    let partition = partition_for(&message.key, workers);
                    if senders[partition].send(message).is_err() {
                        tracing::error!(partition, "partition worker gone, stopping consumer");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(senders);
        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "partition worker panicked");
            }
        }
        tracing::info!(saga_type = W::SAGA_TYPE, "saga consumer stopped");
    }
}

async fn worker<S, W>(
    partition: usize,
    engine: Arc<SagaEngine<S, W>>,
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
) where
    S: SagaStore + 'static,
    W: Workflow,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = process(&engine, &message).await {
            tracing::error!(
                partition,
                error = %e,
                correlation_id = %message.key,
                message_type = %message.message_type,
                "event handling failed"
            );
        }
    }
}

async fn process<S, W>(engine: &SagaEngine<S, W>, message: &BusMessage) -> Result<Option<HandleOutcome>>
where
    S: SagaStore,
    W: Workflow,
{
    match InboundEvent::<W::Event>::decode(message) {
        Ok(inbound) => engine.handle(inbound).await.map(Some),
        Err(e) => {
            engine
                .record_undecodable(
                    Some(message.key.clone()),
                    &message.message_type,
                    message.payload.clone(),
                    &e.to_string(),
                )
                .await?;
            Ok(None)
        }
    }
}
