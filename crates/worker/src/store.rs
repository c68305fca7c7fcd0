//! Saga store selection at startup.

use saga_store::PostgresSagaStore;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

/// Errors that abort worker startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to connect to the database: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Connects to PostgreSQL and brings the schema up to date.
pub async fn connect_postgres(url: &str, max_connections: u32) -> Result<PostgresSagaStore, StartupError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    let store = PostgresSagaStore::new(pool);
    store.run_migrations().await?;
    tracing::info!(max_connections, "connected to PostgreSQL saga store");
    Ok(store)
}
