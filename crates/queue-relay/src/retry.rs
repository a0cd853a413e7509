//! Failure-count envelope for events that are republished after a consumer fails.
//!
//! The count travels inside the event itself as a `failed_tries` field, so any
//! worker that picks the event up again sees how often it has already failed.

use crate::error::{QueueError, SerializationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Republish a failed event at most this many times by default
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A JSON event with its failure count
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    /// Number of times a consumer has failed on this event
    #[serde(default)]
    pub failed_tries: u32,

    /// Every other field of the event
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// What to do with an event after recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish it
    Retry,
    /// Give up and hand it to the failure handler
    Exhausted,
}

/// Result of [`crate::client::QueueService::retry_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Republished,
    /// Republishing failed; the failure was logged and dropped
    RepublishFailed,
    /// The failure handler was invoked instead of republishing
    Exhausted,
}

impl RetryEnvelope {
    /// Parse an event; it must be a JSON object
    pub fn from_value(value: Value) -> Result<Self, QueueError> {
        if !value.is_object() {
            return Err(SerializationError::NotAnObject.into());
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Wrap a JSON object, picking up any `failed_tries` it already carries
    pub fn from_map(payload: Map<String, Value>) -> Result<Self, QueueError> {
        Self::from_value(Value::Object(payload))
    }

    /// The event as it goes back on the wire, `failed_tries` included
    pub fn to_value(&self) -> Result<Value, QueueError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Count one more failure and decide whether another attempt is allowed.
    ///
    /// The event is exhausted once the count exceeds `max_retries`, so with the
    /// default of 3 the event is delivered at most four times.
    pub fn record_failure(&mut self, max_retries: u32) -> RetryDecision {
        self.failed_tries = self.failed_tries.saturating_add(1);

        if self.failed_tries > max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
