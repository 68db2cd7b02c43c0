//! Logging setup

use crate::config::EngineConfig;
use crate::error::ConfigError;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence over `config.log_filter`.
pub fn init_tracing(config: &EngineConfig) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter).map_err(|e| ConfigError::LogFilter {
            filter: config.log_filter.clone(),
            message: e.to_string(),
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}
