//! Loads the order service's configuration from environment variables.
#![deny(missing_docs)]

use std::env;

/// Snapshotting, publishing, consumer and read-model settings for the order
/// service, loaded once at process startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Write a snapshot every N appended events for a given aggregate.
    pub event_log_snapshot_every: u32,
    /// `client.id` for the Kafka producer.
    pub publisher_client_id: String,
    /// `bootstrap.servers` for the Kafka producer.
    pub publisher_bootstrap_servers: String,
    /// Upper bound on a single publish's exponential backoff retry, in
    /// milliseconds.
    pub publisher_retry_max_elapsed_ms: u64,
    /// Consumer group id for the projection consumer.
    pub consumer_group_id: String,
    /// `bootstrap.servers` for the projection consumer.
    pub consumer_bootstrap_servers: String,
    /// `auto.offset.reset` for the projection consumer.
    pub consumer_auto_offset_reset: String,
    /// `enable.auto.commit` for the projection consumer. Must stay `false`:
    /// offsets are committed manually after the read-model transaction
    /// commits, never before.
    pub consumer_enable_auto_commit: bool,
    /// Postgres connection string for the read model.
    pub read_model_database_url: String,
    /// Maximum size of the read model's connection pool.
    pub read_model_max_connections: u32,
    /// Maximum number of out-of-order events parked per aggregate before the
    /// projector dead-letters the aggregate.
    pub projector_park_limit: usize,
}

impl Config {
    /// Loads configuration from the process environment, falling back to a
    /// `.env` file in the current directory if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnv` if a required variable is absent, or
    /// `ConfigError::InvalidValue` if a variable is present but fails to
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let event_log_snapshot_every = parse_with_default("EVENT_LOG_SNAPSHOT_EVERY", 50)?;

        let publisher_client_id = require_env("PUBLISHER_CLIENT_ID")?;
        let publisher_bootstrap_servers = require_env("PUBLISHER_BOOTSTRAP_SERVERS")?;
        let publisher_retry_max_elapsed_ms =
            parse_with_default("PUBLISHER_RETRY_MAX_ELAPSED_MS", 30_000)?;

        let consumer_group_id = env::var("CONSUMER_GROUP_ID")
            .unwrap_or_else(|_| "order-projections".to_string());
        let consumer_bootstrap_servers = require_env("CONSUMER_BOOTSTRAP_SERVERS")?;
        let consumer_auto_offset_reset = env::var("CONSUMER_AUTO_OFFSET_RESET")
            .unwrap_or_else(|_| "earliest".to_string());
        let consumer_enable_auto_commit: bool = parse_with_default(
            "CONSUMER_ENABLE_AUTO_COMMIT",
            false,
        )?;

        let read_model_database_url = require_env("READ_MODEL_DATABASE_URL")?;
        let read_model_max_connections = parse_with_default("READ_MODEL_MAX_CONNECTIONS", 10)?;

        let projector_park_limit = parse_with_default("PROJECTOR_PARK_LIMIT", 128)?;

        Ok(Self {
            event_log_snapshot_every,
            publisher_client_id,
            publisher_bootstrap_servers,
            publisher_retry_max_elapsed_ms,
            consumer_group_id,
            consumer_bootstrap_servers,
            consumer_auto_offset_reset,
            consumer_enable_auto_commit,
            read_model_database_url,
            read_model_max_connections,
            projector_park_limit,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnv(key))
}

fn parse_with_default<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    /// An environment variable was set but could not be parsed.
    #[error("invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
