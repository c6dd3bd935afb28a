//! Process-wide tracing initialization for the order service's binaries.
#![deny(missing_docs)]

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber.
///
/// Filtering is controlled by `RUST_LOG`, defaulting to `info` when unset.
/// Emits newline-delimited JSON when `format` is [`LogFormat::Json`],
/// otherwise human-readable ANSI output. Safe to call multiple times;
/// subsequent calls are no-ops.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(true)
            .try_init(),
    };
    let _ = result;
}

/// The wire shape `tracing` events are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured newline-delimited JSON, suitable for log aggregation.
    Json,
    /// Human-readable ANSI output, suitable for local development.
    Pretty,
}

impl LogFormat {
    /// Reads the log format from the `LOG_FORMAT` environment variable,
    /// defaulting to [`LogFormat::Pretty`] for any unset or unrecognized
    /// value.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}
