//! Message counters.
//!
//! The clients report through [`MetricsSink`] so they do not depend on a
//! particular metrics backend. [`PrometheusMetrics`] is the production
//! implementation; [`NoopMetrics`] is used when nothing is configured.

use crate::message::QueueName;
use prometheus::{IntCounterVec, Registry};

/// Message events that are counted per queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    Published,
    Acked,
    Nacked,
    Drained,
}

impl MetricEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::Drained => "drained",
        }
    }
}

/// Destination for message counters
pub trait MetricsSink: Send + Sync {
    fn increment(&self, event: MetricEvent, queue: &QueueName);
}

/// Discards every counter
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _event: MetricEvent, _queue: &QueueName) {}
}

/// Counts messages in `queue_relay_messages_total{queue, event}`
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    messages_total: IntCounterVec,
}

impl PrometheusMetrics {
    pub const MESSAGES_TOTAL: &'static str = "queue_relay_messages_total";

    /// Register the counters with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        use prometheus::register_int_counter_vec_with_registry;

        Ok(Self {
            messages_total: register_int_counter_vec_with_registry!(
                Self::MESSAGES_TOTAL,
                "Messages handled by the queue client, by queue and event",
                &["queue", "event"],
                registry
            )?,
        })
    }

    /// Register the counters with the process-wide default registry
    pub fn with_default_registry() -> Result<Self, prometheus::Error> {
        Self::new(prometheus::default_registry())
    }

    /// Current value of one counter
    pub fn count(&self, event: MetricEvent, queue: &QueueName) -> u64 {
        self.messages_total
            .with_label_values(&[queue.as_str(), event.as_str()])
            .get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, event: MetricEvent, queue: &QueueName) {
        self.messages_total
            .with_label_values(&[queue.as_str(), event.as_str()])
            .inc();
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
