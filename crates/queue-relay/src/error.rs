//! Error types for queue operations.

use crate::message::DeliveryTag;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Incompatible protocol: {message}")]
    ProtocolIncompatible { message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Unknown delivery tag: {delivery_tag}")]
    UnknownDelivery { delivery_tag: DeliveryTag },

    #[error("Consumer for queue '{queue}' failed on delivery {delivery_tag}: {source}")]
    Handler {
        queue: String,
        delivery_tag: DeliveryTag,
        #[source]
        source: anyhow::Error,
    },

    #[error("Direct dispatch for queue '{queue}' failed: {source}")]
    DirectDispatch {
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Queue client has shut down")]
    ClientShutdown,

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if the error means the connection or channel is unusable.
    ///
    /// These are the errors that a publish recovers from by reconnecting once.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::ChannelClosed { .. } | Self::NotConnected
        )
    }

    /// Check if the error may be logged and dropped while tearing a connection down.
    ///
    /// Only the broker rejecting credentials or the protocol version qualifies.
    pub fn is_ignorable_on_shutdown(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::ProtocolIncompatible { .. }
        )
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::ChannelClosed { .. } => true,
            Self::NotConnected => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ProtocolIncompatible { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::UnknownDelivery { .. } => false,
            Self::Handler { .. } => false,
            Self::DirectDispatch { .. } => false,
            Self::ClientShutdown => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::Io(_) => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } | Self::NotConnected => Some(Duration::from_secs(2)),
            Self::ChannelClosed { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(SerializationError::JsonError(e))
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Retry envelope must be a JSON object")]
    NotAnObject,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
