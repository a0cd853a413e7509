//! Broker transport traits.
//!
//! Two families are defined, one per client model:
//!
//! * [`BlockingBroker`] / [`BlockingConnection`] / [`BlockingChannel`] for the
//!   [`crate::blocking::BlockingQueueClient`], where every call returns once
//!   the broker has answered.
//! * [`AsyncBroker`] / [`AsyncConnection`] / [`AsyncChannel`] for the
//!   [`crate::event_loop::EventQueueClient`], where deliveries and connection
//!   loss are pushed to the client through [`TransportEvents`].
//!
//! Implementations live under [`crate::providers`].

use crate::error::QueueError;
use crate::message::{ConsumerTag, Delivery, DeliveryTag, QueueName};
use crate::settings::ConnectionParams;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle of a client's broker connection.
///
/// `Open` is the only state in which the channel may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Blocking transport
// ============================================================================

/// Opens blocking broker connections
pub trait BlockingBroker: Send + Sync {
    fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn BlockingConnection>, QueueError>;
}

/// One blocking broker connection
pub trait BlockingConnection: Send {
    fn is_open(&self) -> bool;

    fn open_channel(&mut self) -> Result<Box<dyn BlockingChannel>, QueueError>;

    /// Close the connection; closing an already closed connection succeeds
    fn close(&mut self) -> Result<(), QueueError>;
}

/// A blocking channel on a connection
pub trait BlockingChannel: Send {
    /// Idempotently create `queue`
    fn declare_queue(&mut self, queue: &QueueName, durable: bool) -> Result<(), QueueError>;

    /// Publish through the default exchange with routing key = queue name
    fn publish(&mut self, queue: &QueueName, body: Bytes, persistent: bool) -> Result<(), QueueError>;

    /// Start a subscription; its deliveries are returned by [`Self::next_delivery`]
    fn subscribe(&mut self, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError>;

    fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;

    fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError>;

    /// Take one message off `queue` without subscribing; `None` when it is empty
    fn fetch_one(&mut self, queue: &QueueName) -> Result<Option<Delivery>, QueueError>;

    /// Wait up to `timeout` for the next delivery on any subscription
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;
}

// ============================================================================
// Event-driven transport
// ============================================================================

/// Something the broker pushed to an event-driven connection
#[derive(Debug)]
pub enum TransportEvent {
    Delivery(Delivery),
    /// The connection went away without the client asking for it
    Closed(QueueError),
}

/// Sink for events of one connection attempt.
///
/// Every connection attempt gets its own generation; the client ignores
/// events carrying a generation other than the current one.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    sink: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, sink: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, sink }
    }

    /// A sink that is not attached to a client, with the receiving end
    pub fn channel(generation: u64) -> (Self, mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
        let (sink, receiver) = mpsc::unbounded_channel();
        (Self { generation, sink }, receiver)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Push a delivery; returns false once the client has gone away
    pub fn deliver(&self, delivery: Delivery) -> bool {
        self.sink
            .send((self.generation, TransportEvent::Delivery(delivery)))
            .is_ok()
    }

    /// Report that the connection closed unexpectedly
    pub fn closed(&self, reason: QueueError) -> bool {
        self.sink
            .send((self.generation, TransportEvent::Closed(reason)))
            .is_ok()
    }

    pub fn is_detached(&self) -> bool {
        self.sink.is_closed()
    }
}

/// Opens event-driven broker connections
#[async_trait]
pub trait AsyncBroker: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParams,
        events: TransportEvents,
    ) -> Result<Arc<dyn AsyncConnection>, QueueError>;
}

/// One event-driven broker connection
#[async_trait]
pub trait AsyncConnection: Send + Sync {
    /// Open a channel; deliveries for its subscriptions go to the
    /// connection's [`TransportEvents`]
    async fn open_channel(&self) -> Result<Arc<dyn AsyncChannel>, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// An event-driven channel on a connection
#[async_trait]
pub trait AsyncChannel: Send + Sync {
    async fn declare_queue(&self, queue: &QueueName, durable: bool) -> Result<(), QueueError>;

    async fn publish(&self, queue: &QueueName, body: Bytes, persistent: bool) -> Result<(), QueueError>;

    async fn subscribe(&self, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError>;
}
