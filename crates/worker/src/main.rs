//! Saga worker entry point.

use axum::Router;
use saga_store::{InMemorySagaStore, SagaStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::{Config, Pipeline, StartupError};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Serves the API and runs the pipeline until a shutdown signal arrives.
async fn serve<S: SagaStore + Clone + 'static>(
    config: &Config,
    store: S,
    store_kind: &'static str,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Result<(), StartupError> {
    let state = worker::create_state(store, config, store_kind);
    let pipeline = Pipeline::start(config, &state);
    let app: Router = worker::create_app(state, metrics_handle);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(%addr, store = store_kind, "starting saga worker");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve);

    // Stop consuming only after in-flight requests are done
    pipeline.stop().await;
    served
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the saga store and run
    let result = match config.database_url.as_deref() {
        Some(url) => match worker::connect_postgres(url, config.database_max_connections).await {
            Ok(store) => serve(&config, store, "postgres", metrics_handle).await,
            Err(e) => Err(e),
        },
        None => {
            tracing::warn!("DATABASE_URL not set, saga state is kept in memory only");
            serve(&config, InMemorySagaStore::new(), "memory", metrics_handle).await
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "saga worker failed");
        std::process::exit(1);
    }

    tracing::info!("saga worker shut down gracefully");
}
