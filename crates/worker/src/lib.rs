//! Saga worker: event consumer, outbox relay and HTTP inspection API.
//!
//! Runs the order fulfillment saga against a saga store, with structured
//! logging (tracing) and Prometheus metrics. The HTTP surface accepts
//! inbound events and exposes saga instances and the operator queue.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod routes;
pub mod store;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use domain::OrderFulfillment;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryEventBus, SagaEngine};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use pipeline::Pipeline;
pub use store::{StartupError, connect_postgres};

/// Shared state of the HTTP handlers and the pipeline tasks.
pub struct AppState<S: SagaStore + Clone + 'static> {
    pub engine: Arc<SagaEngine<S, OrderFulfillment>>,
    pub bus: InMemoryEventBus,
    /// Backend name reported by the health check.
    pub store_kind: &'static str,
}

/// Builds the application state around `store`.
pub fn create_state<S: SagaStore + Clone + 'static>(
    store: S,
    config: &Config,
    store_kind: &'static str,
) -> Arc<AppState<S>> {
    let engine = SagaEngine::with_config(store, OrderFulfillment::new(), config.engine_config());
    Arc::new(AppState {
        engine: Arc::new(engine),
        bus: InMemoryEventBus::new(),
        store_kind,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/events", post(routes::events::publish::<S>))
        .route("/sagas/{key}", get(routes::sagas::get::<S>))
        .route("/sagas/{key}/transitions", get(routes::sagas::transitions::<S>))
        .route("/sagas/{key}/outbox", get(routes::sagas::outbox::<S>))
        .route("/dead-letters", get(routes::dead_letters::list::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
