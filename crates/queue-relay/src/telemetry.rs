//! Logging setup for applications embedding the queue client.

use crate::error::ConfigurationError;
use crate::settings::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "telemetry_tests.rs"]
mod tests;

/// Build the filter used by [`init_logging`].
///
/// `RUST_LOG` wins when it is set and parses; otherwise the configured level is used.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigurationError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.level).map_err(|e| ConfigurationError::Invalid {
        message: format!("invalid logging level '{}': {}", config.level, e),
    })
}

/// Install the global tracing subscriber.
///
/// Fails instead of panicking when a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigurationError> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_format {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(|e| ConfigurationError::Invalid {
        message: format!("failed to install tracing subscriber: {}", e),
    })
}
