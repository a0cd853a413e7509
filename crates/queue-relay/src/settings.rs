//! Client configuration.
//!
//! Settings are loaded (later sources override earlier ones) from:
//!  1. Built-in defaults on every section
//!  2. An optional YAML/TOML/JSON file
//!  3. Environment variables prefixed `QUEUE_RELAY` with `__` as the nesting
//!     separator, e.g. `QUEUE_RELAY__CONNECTION__HOST=rabbitmq`

use crate::error::ConfigurationError;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "QUEUE_RELAY";

/// Top-level configuration for a queue client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Publish through the broker; when false events are handed to workers in-process
    pub using_broker: bool,

    /// Use the event-driven client instead of the blocking one
    pub event_loop_mode: bool,

    /// Broker connection parameters
    pub connection: ConnectionParams,

    /// Reconnect behaviour of the event-driven client
    pub reconnect: ReconnectSettings,

    /// Consumer acknowledgement settings
    pub consumer: ConsumerSettings,

    /// Retry envelope settings
    pub retry: RetrySettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            using_broker: true,
            event_loop_mode: false,
            connection: ConnectionParams::default(),
            reconnect: ReconnectSettings::default(),
            consumer: ConsumerSettings::default(),
            retry: RetrySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl QueueSettings {
    /// Load settings from an optional file plus `QUEUE_RELAY__*` environment variables.
    ///
    /// A missing `path` is not an error; a path that does not exist is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let settings: Self = config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check settings for values the client cannot work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.connection.validate()?;
        self.reconnect.validate()?;

        if self.consumer.poll_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "consumer.poll_interval_ms must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Parameters used to open a broker connection
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,

    /// Heartbeat interval in seconds; `Some(0)` disables heartbeats and
    /// `None` accepts the broker's proposal
    pub heartbeat_secs: Option<u16>,

    /// Transport-level connect timeout in seconds
    pub connection_timeout_secs: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: None,
            connection_timeout_secs: 10,
        }
    }
}

impl ConnectionParams {
    /// Parameters for the blocking client, which cannot answer heartbeat frames
    pub fn for_blocking(&self) -> Self {
        Self {
            heartbeat_secs: Some(0),
            ..self.clone()
        }
    }

    pub fn heartbeats_disabled(&self) -> bool {
        self.heartbeat_secs == Some(0)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "connection.host".to_string(),
            });
        }

        if self.port == 0 {
            return Err(ConfigurationError::Invalid {
                message: "connection.port must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .finish()
    }
}

// ============================================================================
// Reconnect
// ============================================================================

/// How the delay between reconnect attempts evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    Fixed,
    ExponentialBackoff,
}

/// Reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub strategy: ReconnectStrategy,

    /// Fixed delay, or the first delay when backing off
    pub delay_ms: u64,

    /// Cap on the backoff delay
    pub max_delay_ms: u64,

    /// Backoff growth factor
    pub multiplier: f64,

    /// Jitter range as a fraction of the delay (0.0 to 1.0)
    pub jitter_percent: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed,
            delay_ms: 2_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_percent: 0.25,
        }
    }
}

impl ReconnectSettings {
    /// Build the policy described by these settings
    pub fn policy(&self) -> ReconnectPolicy {
        match self.strategy {
            ReconnectStrategy::Fixed => ReconnectPolicy::fixed(Duration::from_millis(self.delay_ms)),
            ReconnectStrategy::ExponentialBackoff => ReconnectPolicy::exponential(
                Duration::from_millis(self.delay_ms),
                Duration::from_millis(self.max_delay_ms),
                self.multiplier,
            )
            .with_jitter_percent(self.jitter_percent),
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.delay_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "reconnect.delay_ms must be greater than zero".to_string(),
            });
        }

        if self.strategy == ReconnectStrategy::ExponentialBackoff {
            if self.max_delay_ms < self.delay_ms {
                return Err(ConfigurationError::Invalid {
                    message: "reconnect.max_delay_ms must not be below reconnect.delay_ms"
                        .to_string(),
                });
            }

            if self.multiplier < 1.0 {
                return Err(ConfigurationError::Invalid {
                    message: "reconnect.multiplier must be at least 1.0".to_string(),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ConfigurationError::Invalid {
                message: "reconnect.jitter_percent must be between 0.0 and 1.0".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Consumers, retries and logging
// ============================================================================

/// Consumer acknowledgement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Ask the broker to requeue a delivery whose consumer failed
    pub requeue_on_failure: bool,

    /// How long the blocking dispatch loop waits for a delivery before
    /// checking whether it was asked to stop
    pub poll_interval_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            requeue_on_failure: true,
            poll_interval_ms: 500,
        }
    }
}

/// Retry envelope configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Republish a failed event at most this many times
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: crate::retry::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level or filter directive, used when `RUST_LOG` is unset
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

// ============================================================================
// Runtime options
// ============================================================================

/// Runtime options shared by both client models
#[derive(Clone)]
pub struct ClientOptions {
    pub reconnect: ReconnectPolicy,
    pub requeue_on_failure: bool,
    pub poll_interval: Duration,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            requeue_on_failure: true,
            poll_interval: Duration::from_millis(500),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl ClientOptions {
    /// Derive runtime options from loaded settings
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            reconnect: settings.reconnect.policy(),
            requeue_on_failure: settings.consumer.requeue_on_failure,
            poll_interval: Duration::from_millis(settings.consumer.poll_interval_ms),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Report counters to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
