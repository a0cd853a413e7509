//! Blocking queue client.
//!
//! Every operation returns once the broker has answered. The client owns its
//! connection outright (`&mut self` everywhere), so a process that shares one
//! client between threads must hand it to a single owner, as
//! [`crate::client::QueueService`] does.
//!
//! Heartbeats are always disabled: the client only talks to the broker while
//! one of its methods runs and could not answer heartbeat frames in between.

use crate::cache::QueueDeclarationCache;
use crate::error::QueueError;
use crate::message::{ConsumerId, ConsumerTag, Delivery, QueueName};
use crate::metrics::MetricEvent;
use crate::registry::{
    invoke_handler, wrap_handler, wrap_json_handler, ConsumerHandler, ConsumerRegistry,
};
use crate::settings::{ClientOptions, ConnectionParams};
use crate::transport::{BlockingBroker, BlockingChannel, BlockingConnection, ConnectionState};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Asks a running [`BlockingQueueClient::start_consuming`] loop to return
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Queue client that performs every broker operation synchronously
pub struct BlockingQueueClient {
    broker: Arc<dyn BlockingBroker>,
    params: ConnectionParams,
    options: ClientOptions,
    state: ConnectionState,
    connection: Option<Box<dyn BlockingConnection>>,
    channel: Option<Box<dyn BlockingChannel>>,
    declared: QueueDeclarationCache,
    consumers: ConsumerRegistry,
    stop: StopHandle,
}

impl BlockingQueueClient {
    /// Connect to the broker and open a channel.
    ///
    /// Any connection failure, authentication included, is returned.
    pub fn connect(
        broker: Arc<dyn BlockingBroker>,
        params: &ConnectionParams,
        options: ClientOptions,
    ) -> Result<Self, QueueError> {
        let mut client = Self {
            broker,
            params: params.for_blocking(),
            options,
            state: ConnectionState::Disconnected,
            connection: None,
            channel: None,
            declared: QueueDeclarationCache::new(),
            consumers: ConsumerRegistry::new(),
            stop: StopHandle::default(),
        };

        client.open()?;
        Ok(client)
    }

    fn open(&mut self) -> Result<(), QueueError> {
        let start = Instant::now();
        self.state = ConnectionState::Connecting;
        debug!(
            host = %self.params.host,
            port = self.params.port,
            "Connecting blocking queue client"
        );

        let mut connection = match self.broker.connect(&self.params) {
            Ok(connection) => connection,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let channel = match connection.open_channel() {
            Ok(channel) => channel,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                if let Err(close_error) = connection.close() {
                    debug!(error = %close_error, "Closing half-open connection failed");
                }
                return Err(e);
            }
        };

        self.connection = Some(connection);
        self.channel = Some(channel);
        self.state = ConnectionState::Open;

        info!(
            host = %self.params.host,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Blocking queue client connected"
        );
        Ok(())
    }

    /// Drop the connection, forgetting declarations and subscriptions.
    ///
    /// Authentication and protocol errors from the broker while closing are
    /// logged and dropped, as are errors from a connection that is already
    /// gone. Anything else is returned.
    fn teardown(&mut self) -> Result<(), QueueError> {
        self.channel = None;
        self.declared.clear();
        self.consumers.invalidate_tags();
        self.state = ConnectionState::Disconnected;

        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        match connection.close() {
            Ok(()) => Ok(()),
            Err(e) if e.is_ignorable_on_shutdown() => {
                warn!(error = %e, "Ignoring broker error while closing connection");
                Ok(())
            }
            Err(e) if e.is_connection_error() => {
                debug!(error = %e, "Connection was already gone when closing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the connection and subscribe every registered consumer again
    pub fn reconnect(&mut self) -> Result<(), QueueError> {
        info!("Reconnecting blocking queue client");
        self.teardown()?;
        self.open()?;
        self.replay_consumers()
    }

    /// Close the connection; a later operation reconnects
    pub fn close(&mut self) -> Result<(), QueueError> {
        self.teardown()?;
        info!("Blocking queue client closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Open && self.channel.is_some()
    }

    /// Check whether `queue` has been declared on the current connection
    pub fn is_declared(&self, queue: &QueueName) -> bool {
        self.declared.contains(queue)
    }

    pub fn declared_queues(&self) -> Vec<QueueName> {
        self.declared.names()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Tag consumer `id` is subscribed under on the current connection
    pub fn current_consumer_tag(&self, id: ConsumerId) -> Option<&ConsumerTag> {
        self.consumers.current_tag(id)
    }

    fn connection_is_open(&self) -> bool {
        self.channel.is_some() && self.connection.as_ref().is_some_and(|c| c.is_open())
    }

    // ========================================================================
    // Queue operations
    // ========================================================================

    /// Run `action` against a channel on which `queue` is known to exist.
    ///
    /// Reconnects first if the connection is not open, then declares `queue`
    /// if it has not been declared on this connection yet.
    pub fn ensure_queue<R, F>(&mut self, queue: &QueueName, action: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut dyn BlockingChannel) -> Result<R, QueueError>,
    {
        if !self.connection_is_open() {
            info!(queue = %queue, "Connection is not open, reconnecting");
            self.reconnect()?;
        }

        self.with_declared(queue, action)
    }

    fn with_declared<R, F>(&mut self, queue: &QueueName, action: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut dyn BlockingChannel) -> Result<R, QueueError>,
    {
        let channel = self.channel.as_deref_mut().ok_or(QueueError::NotConnected)?;

        if !self.declared.contains(queue) {
            channel.declare_queue(queue, true)?;
            self.declared.mark_declared(queue.clone());
            debug!(queue = %queue, "Declared queue");
        }

        action(channel)
    }

    /// Publish a persistent message to `queue`
    pub fn publish(&mut self, queue: &QueueName, body: impl Into<Bytes>) -> Result<(), QueueError> {
        let body = body.into();
        let metrics = Arc::clone(&self.options.metrics);

        self.ensure_queue(queue, |channel| {
            channel.publish(queue, body, true)?;
            metrics.increment(MetricEvent::Published, queue);
            Ok(())
        })
    }

    /// Serialize `payload` as JSON and publish it.
    ///
    /// A connection-level failure triggers exactly one reconnect and one more
    /// attempt; a second failure is returned.
    pub fn json_publish<T>(&mut self, queue: &QueueName, payload: &T) -> Result<(), QueueError>
    where
        T: Serialize + ?Sized,
    {
        let body = Bytes::from(serde_json::to_vec(payload)?);
        self.publish_with_retry(queue, body)
    }

    pub(crate) fn publish_with_retry(&mut self, queue: &QueueName, body: Bytes) -> Result<(), QueueError> {
        match self.publish(queue, body.clone()) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_connection_error() => {
                warn!(
                    queue = %queue,
                    error = %e,
                    "Failed to publish, reconnecting and sending again"
                );
            }
            Err(e) => return Err(e),
        }

        self.reconnect()?;
        self.publish(queue, body)
    }

    /// Remove every message currently in `queue`, acknowledging each one
    pub fn drain_queue(&mut self, queue: &QueueName) -> Result<Vec<Bytes>, QueueError> {
        let metrics = Arc::clone(&self.options.metrics);

        let messages = self.ensure_queue(queue, |channel| {
            let mut messages = Vec::new();
            while let Some(delivery) = channel.fetch_one(queue)? {
                channel.ack(delivery.delivery_tag)?;
                metrics.increment(MetricEvent::Drained, queue);
                messages.push(delivery.body);
            }
            Ok(messages)
        })?;

        debug!(queue = %queue, count = messages.len(), "Drained queue");
        Ok(messages)
    }

    /// Drain `queue` and decode every message as JSON.
    ///
    /// The queue is emptied before decoding starts, so a message that fails
    /// to decode is lost along with the rest of the batch.
    pub fn drain_queue_json<T: DeserializeOwned>(&mut self, queue: &QueueName) -> Result<Vec<T>, QueueError> {
        self.drain_queue(queue)?
            .iter()
            .map(|body| serde_json::from_slice(body).map_err(QueueError::from))
            .collect()
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    /// Register `handler` for `queue` and subscribe it right away.
    ///
    /// The registration survives reconnects: every new connection subscribes
    /// the handler again under a fresh consumer tag.
    pub fn register_consumer<F>(&mut self, queue: &QueueName, handler: F) -> Result<ConsumerId, QueueError>
    where
        F: Fn(&Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(queue, wrap_handler(handler))
    }

    /// Register a handler that receives each message body decoded as JSON
    pub fn register_json_consumer<T, F>(&mut self, queue: &QueueName, handler: F) -> Result<ConsumerId, QueueError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(queue, wrap_json_handler(handler))
    }

    fn register_handler(&mut self, queue: &QueueName, handler: ConsumerHandler) -> Result<ConsumerId, QueueError> {
        // Reconnect before registering so the replay does not subscribe it too
        if !self.connection_is_open() {
            info!(queue = %queue, "Connection is not open, reconnecting");
            self.reconnect()?;
        }

        let id = ConsumerId::new();
        self.consumers.register(queue.clone(), id, handler);

        let tag = ConsumerTag::generate(queue);
        self.with_declared(queue, |channel| channel.subscribe(queue, &tag))?;
        self.consumers.activate(id, tag.clone());

        info!(queue = %queue, consumer_tag = %tag, "Registered consumer");
        Ok(id)
    }

    fn replay_consumers(&mut self) -> Result<(), QueueError> {
        for (queue, id) in self.consumers.replay_plan() {
            let tag = ConsumerTag::generate(&queue);
            self.with_declared(&queue, |channel| channel.subscribe(&queue, &tag))?;
            self.consumers.activate(id, tag.clone());
            debug!(queue = %queue, consumer_tag = %tag, "Re-subscribed consumer");
        }
        Ok(())
    }

    /// Handle that stops [`Self::start_consuming`] from another thread or a handler
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Dispatch deliveries that are already waiting, without blocking
    pub fn consume_pending(&mut self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while let Some(delivery) = self.next_delivery(Duration::ZERO)? {
            self.dispatch(delivery)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Dispatch deliveries until the stop handle fires or a consumer fails.
    ///
    /// A consumer failure is returned after its delivery has been rejected.
    pub fn start_consuming(&mut self) -> Result<(), QueueError> {
        info!(consumers = self.consumers.len(), "Starting blocking dispatch loop");

        while !self.stop.is_stopped() {
            let poll_interval = self.options.poll_interval;
            if let Some(delivery) = self.next_delivery(poll_interval)? {
                self.dispatch(delivery)?;
            }
        }

        self.stop.reset();
        info!("Blocking dispatch loop stopped");
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let channel = self.channel.as_deref_mut().ok_or(QueueError::NotConnected)?;
        channel.next_delivery(timeout)
    }

    fn dispatch(&mut self, delivery: Delivery) -> Result<(), QueueError> {
        let delivery_tag = delivery.delivery_tag;
        let target = delivery
            .consumer_tag
            .as_ref()
            .and_then(|tag| self.consumers.lookup(tag));
        let channel = self.channel.as_deref_mut().ok_or(QueueError::NotConnected)?;

        let Some((queue, handler)) = target else {
            warn!(
                delivery_tag = %delivery_tag,
                queue = %delivery.queue,
                "Delivery for unknown consumer, returning it to the queue"
            );
            return channel.nack(delivery_tag, true);
        };

        match invoke_handler(&handler, &delivery) {
            Ok(()) => {
                channel.ack(delivery_tag)?;
                self.options.metrics.increment(MetricEvent::Acked, &queue);
                Ok(())
            }
            Err(source) => {
                let requeue = self.options.requeue_on_failure;
                error!(
                    queue = %queue,
                    delivery_tag = %delivery_tag,
                    requeue = requeue,
                    error = %source,
                    "Consumer failed, rejecting delivery"
                );
                channel.nack(delivery_tag, requeue)?;
                self.options.metrics.increment(MetricEvent::Nacked, &queue);

                Err(QueueError::Handler {
                    queue: queue.to_string(),
                    delivery_tag,
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for BlockingQueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueueClient")
            .field("params", &self.params)
            .field("state", &self.state)
            .field("declared", &self.declared)
            .field("consumers", &self.consumers)
            .finish()
    }
}

#[cfg(test)]
#[path = "blocking_tests.rs"]
mod tests;
