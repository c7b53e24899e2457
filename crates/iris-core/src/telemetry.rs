use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{IrisError, Result};

/// Install the global fmt subscriber.
///
/// RUST_LOG takes precedence over `default_filter`. Calling this more than
/// once reports an error instead of panicking, so tests may call it freely.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| IrisError::Telemetry(e.to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| IrisError::Telemetry(e.to_string()))
}

/// Install the global subscriber with the filter from `[logging]`.
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_tracing(&config.filter)
}
