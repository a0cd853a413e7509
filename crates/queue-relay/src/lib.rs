//! # Queue Relay
//!
//! Message-queue client that keeps a broker connection usable for the rest of
//! an application: it reconnects, declares queues before first use, replays
//! consumer subscriptions after a reconnect and acknowledges deliveries based
//! on the consumer's result.
//!
//! This library provides:
//! - A blocking client for synchronous code
//! - An event-driven client running as a tokio task
//! - Bulk draining of a queue
//! - Bounded republishing of failed events
//! - An in-memory broker, and an AMQP broker behind the `amqp` feature
//!
//! ## Module Organization
//!
//! - [`transport`] - Broker traits both clients are written against
//! - [`blocking`] - Synchronous client
//! - [`event_loop`] - Event-driven client
//! - [`client`] - Process-level service selecting a client from settings
//! - [`providers`] - Broker implementations
//! - [`settings`] - Configuration loading
//! - [`error`] - Error types for all queue operations

pub mod blocking;
pub mod cache;
pub mod client;
pub mod error;
pub mod event_loop;
pub mod message;
pub mod metrics;
pub mod providers;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use blocking::{BlockingQueueClient, StopHandle};
pub use cache::QueueDeclarationCache;
pub use client::{QueueService, QueueServiceBuilder, ServiceMode, WorkerLookup};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use event_loop::EventQueueClient;
pub use message::{ConsumerId, ConsumerTag, Delivery, DeliveryTag, QueueName, Timestamp};
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use providers::InMemoryBroker;
pub use reconnect::ReconnectPolicy;
pub use registry::{ConsumerHandler, ConsumerRegistry};
pub use retry::{RetryDecision, RetryEnvelope, RetryOutcome, DEFAULT_MAX_RETRIES};
pub use settings::{ClientOptions, ConnectionParams, LoggingConfig, QueueSettings};
pub use transport::ConnectionState;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
