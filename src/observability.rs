//! Logging setup
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init_logging`] once to install a subscriber. `RUST_LOG` takes
//! precedence over the configured level.

use crate::config::LogConfig;
use crate::error::StorageError;
use tracing_subscriber::EnvFilter;

pub fn init_logging(config: &LogConfig) -> Result<(), StorageError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| StorageError::Config(format!("log level '{}': {}", config.level, e)))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| StorageError::Config(format!("logging already initialized: {}", e)))
}
