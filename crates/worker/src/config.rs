//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{ConsumerConfig, EngineConfig, RelayConfig};

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; the in-memory store is used when unset
/// - `DATABASE_MAX_CONNECTIONS`: connection pool size (default: `10`)
/// - `CONSUMER_WORKERS`: partition workers of the event consumer (default: `4`)
/// - `MAX_WRITE_ATTEMPTS`: version-conflict and store-error retries per event (default: `5`)
/// - `WRITE_RETRY_BACKOFF_MS`: first pause after a store error, growing linearly (default: `20`)
/// - `OUTBOX_BATCH_SIZE`: outbox entries per relay pass (default: `100`)
/// - `OUTBOX_POLL_INTERVAL_MS`: pause between relay passes (default: `200`)
/// - `OUTBOX_MAX_ATTEMPTS`: failed publishes before an entry is abandoned (default: `5`)
/// - `SIMULATE_DOWNSTREAM`: run the in-memory downstream services (default: `true`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub consumer_workers: usize,
    pub max_write_attempts: u32,
    pub write_retry_backoff_ms: u64,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval_ms: u64,
    pub outbox_max_attempts: u32,
    pub simulate_downstream: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: positive(parse_var(&lookup, "DATABASE_MAX_CONNECTIONS"))
                .unwrap_or(defaults.database_max_connections),
            consumer_workers: positive(parse_var(&lookup, "CONSUMER_WORKERS"))
                .unwrap_or(defaults.consumer_workers),
            max_write_attempts: positive(parse_var(&lookup, "MAX_WRITE_ATTEMPTS"))
                .unwrap_or(defaults.max_write_attempts),
            write_retry_backoff_ms: parse_var(&lookup, "WRITE_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.write_retry_backoff_ms),
            outbox_batch_size: positive(parse_var(&lookup, "OUTBOX_BATCH_SIZE"))
                .unwrap_or(defaults.outbox_batch_size),
            outbox_poll_interval_ms: positive(parse_var(&lookup, "OUTBOX_POLL_INTERVAL_MS"))
                .unwrap_or(defaults.outbox_poll_interval_ms),
            outbox_max_attempts: positive(parse_var(&lookup, "OUTBOX_MAX_ATTEMPTS"))
                .unwrap_or(defaults.outbox_max_attempts),
            simulate_downstream: lookup("SIMULATE_DOWNSTREAM")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.simulate_downstream),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_write_attempts: self.max_write_attempts,
            retry_backoff: Duration::from_millis(self.write_retry_backoff_ms),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            workers: self.consumer_workers,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            batch_size: self.outbox_batch_size,
            poll_interval: Duration::from_millis(self.outbox_poll_interval_ms),
            max_dispatch_attempts: self.outbox_max_attempts,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            database_max_connections: 10,
            consumer_workers: 4,
            max_write_attempts: 5,
            write_retry_backoff_ms: 20,
            outbox_batch_size: 100,
            outbox_poll_interval_ms: 200,
            outbox_max_attempts: 5,
            simulate_downstream: true,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

fn positive<T: PartialOrd + Default>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v > T::default())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
