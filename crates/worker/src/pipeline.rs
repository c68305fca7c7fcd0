//! Background tasks that move orders through the saga.
//!
//! The pipeline runs the event consumer, the outbox relay and, when
//! configured, the in-memory downstream services. All subscriptions are
//! taken before any task starts so no message is published to an empty
//! topic.

use std::sync::Arc;

use domain::fulfillment::EVENTS_TOPIC;
use saga::{EventBus, InMemoryDownstream, OutboxRelay, SagaConsumer};
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::AppState;
use crate::config::Config;

/// Handle on the running background tasks.
pub struct Pipeline {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    downstream: Option<Arc<InMemoryDownstream>>,
}

impl Pipeline {
    /// Subscribes to the bus and spawns the pipeline tasks.
    pub fn start<S: SagaStore + Clone + 'static>(config: &Config, state: &Arc<AppState<S>>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let downstream = config.simulate_downstream.then(|| {
            let downstream = Arc::new(InMemoryDownstream::in_memory());
            let subscriptions = InMemoryDownstream::subscribe(&state.bus);
            let running = Arc::clone(&downstream);
            let bus = state.bus.clone();
            let rx = rx.clone();
            tasks.push((
                "downstream",
                tokio::spawn(async move { running.run(subscriptions, &bus, rx).await }),
            ));
            downstream
        });

        let subscription = state.bus.subscribe(EVENTS_TOPIC);
        let consumer = SagaConsumer::with_config(Arc::clone(&state.engine), config.consumer_config());
        {
            let rx = rx.clone();
            tasks.push((
                "consumer",
                tokio::spawn(async move { consumer.run(subscription, rx).await }),
            ));
        }

        let relay = OutboxRelay::with_config(
            state.engine.store().clone(),
            state.bus.clone(),
            config.relay_config(),
        );
        tasks.push(("relay", tokio::spawn(async move { relay.run(rx).await })));

        tracing::info!(
            tasks = tasks.len(),
            simulate_downstream = config.simulate_downstream,
            "saga pipeline started"
        );

        Self {
            shutdown,
            tasks,
            downstream,
        }
    }

    /// The simulated downstream services, if they run.
    pub fn downstream(&self) -> Option<&Arc<InMemoryDownstream>> {
        self.downstream.as_ref()
    }

    /// Signals shutdown and waits for every task to finish its current message.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "pipeline task panicked");
            }
        }
        tracing::info!("saga pipeline stopped");
    }
}
