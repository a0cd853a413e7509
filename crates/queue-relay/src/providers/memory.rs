//! In-memory broker implementation for testing and development.
//!
//! This module provides a broker that behaves like a single AMQP node:
//! - Queues must be declared before anything is published to them
//! - Messages are delivered FIFO, round-robin across a queue's subscribers
//! - Deliveries stay unacknowledged until acked or nacked; unacked messages
//!   go back to the front of their queue when their connection closes
//! - Connect, publish and close failures can be injected
//!
//! Both transport families are implemented, so the same broker instance can
//! back a blocking client and an event-driven client at once.

use crate::error::QueueError;
use crate::message::{ConsumerTag, Delivery, DeliveryTag, QueueName, Timestamp};
use crate::settings::ConnectionParams;
use crate::transport::{
    AsyncBroker, AsyncChannel, AsyncConnection, BlockingBroker, BlockingChannel,
    BlockingConnection, TransportEvents,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct MemoryQueue {
    durable: bool,
    messages: VecDeque<StoredMessage>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
}

impl MemoryQueue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            messages: VecDeque::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
        }
    }
}

struct Subscriber {
    connection: u64,
    tag: ConsumerTag,
}

struct StoredMessage {
    body: Bytes,
    redelivered: bool,
}

/// A delivered message waiting for ack or nack
struct Unacked {
    connection: u64,
    queue: QueueName,
    message: StoredMessage,
}

/// Where deliveries for a connection's subscriptions go
enum DeliverySink {
    /// Blocking connections read deliveries with `next_delivery`
    Outbox(VecDeque<Delivery>),
    /// Event-driven connections get deliveries pushed
    Events(TransportEvents),
}

struct ConnectionEntry {
    open: bool,
    sink: DeliverySink,
}

#[derive(Default)]
struct Faults {
    connect_failures: u32,
    publish_failures: u32,
    close_failure: Option<InjectedFault>,
    refused_declares: HashSet<QueueName>,
}

#[derive(Default)]
struct Stats {
    connect_attempts: u32,
    publish_attempts: u32,
    declares: HashMap<QueueName, u32>,
    acks: Vec<DeliveryTag>,
    nacks: Vec<(DeliveryTag, bool)>,
}

#[derive(Default)]
struct BrokerState {
    credentials: Option<(String, String)>,
    queues: HashMap<QueueName, MemoryQueue>,
    connections: HashMap<u64, ConnectionEntry>,
    unacked: BTreeMap<DeliveryTag, Unacked>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    faults: Faults,
    stats: Stats,
}

impl BrokerState {
    fn ensure_open(&self, connection: u64) -> Result<(), QueueError> {
        match self.connections.get(&connection) {
            Some(entry) if entry.open => Ok(()),
            _ => Err(QueueError::ChannelClosed {
                message: format!("connection {} is closed", connection),
            }),
        }
    }

    fn queue_mut(&mut self, queue: &QueueName) -> Result<&mut MemoryQueue, QueueError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }

    fn allocate_tag(&mut self) -> DeliveryTag {
        self.next_delivery_tag += 1;
        DeliveryTag::new(self.next_delivery_tag)
    }

    /// Hand ready messages of `queue_name` to its subscribers, round-robin
    fn dispatch(&mut self, queue_name: &QueueName) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.subscribers.is_empty() {
                return;
            }

            let index = queue.next_subscriber % queue.subscribers.len();
            queue.next_subscriber = index + 1;
            let connection = queue.subscribers[index].connection;
            let consumer_tag = queue.subscribers[index].tag.clone();

            let reachable = self
                .connections
                .get(&connection)
                .is_some_and(|entry| entry.open);
            if !reachable {
                queue.subscribers.remove(index);
                continue;
            }

            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let delivery_tag = self.allocate_tag();
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: Some(consumer_tag),
                queue: queue_name.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
                delivered_at: Timestamp::now(),
            };
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    connection,
                    queue: queue_name.clone(),
                    message,
                },
            );

            if let Some(entry) = self.connections.get_mut(&connection) {
                match &mut entry.sink {
                    DeliverySink::Outbox(outbox) => outbox.push_back(delivery),
                    DeliverySink::Events(events) => {
                        events.deliver(delivery);
                    }
                }
            }
        }
    }

    /// Close `connection`, returning its unacknowledged messages to their queues
    fn drop_connection(&mut self, connection: u64, reason: Option<QueueError>) {
        let Some(entry) = self.connections.get_mut(&connection) else {
            return;
        };
        if !entry.open {
            return;
        }
        entry.open = false;
        let sink = std::mem::replace(&mut entry.sink, DeliverySink::Outbox(VecDeque::new()));

        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.connection != connection);
        }

        let owned: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();

        let mut affected = Vec::new();
        for tag in owned.into_iter().rev() {
            let Some(unacked) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(StoredMessage {
                    body: unacked.message.body,
                    redelivered: true,
                });
            }
            affected.push(unacked.queue);
        }
        affected.sort();
        affected.dedup();

        if let (Some(reason), DeliverySink::Events(events)) = (reason, &sink) {
            events.closed(reason);
        }

        debug!(
            connection = connection,
            requeued_queues = affected.len(),
            "In-memory connection closed"
        );

        for queue in affected {
            self.dispatch(&queue);
        }
    }
}

// ============================================================================
// Shared broker core
// ============================================================================

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    delivered: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self, params: &ConnectionParams, sink: DeliverySink) -> Result<u64, QueueError> {
        let mut state = self.lock();
        state.stats.connect_attempts += 1;

        if state.faults.connect_failures > 0 {
            state.faults.connect_failures -= 1;
            return Err(QueueError::ConnectionFailed {
                message: format!("connection refused by {}:{}", params.host, params.port),
            });
        }

        if let Some((username, password)) = &state.credentials {
            if *username != params.username || *password != params.password {
                return Err(QueueError::AuthenticationFailed {
                    message: format!("ACCESS_REFUSED for user '{}'", params.username),
                });
            }
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state
            .connections
            .insert(id, ConnectionEntry { open: true, sink });
        Ok(id)
    }

    fn is_open(&self, connection: u64) -> bool {
        self.lock().ensure_open(connection).is_ok()
    }

    fn close(&self, connection: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        let fault = state.faults.close_failure.take();
        state.drop_connection(connection, None);
        drop(state);
        self.delivered.notify_all();

        match fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn declare(&self, connection: u64, queue: &QueueName, durable: bool) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.ensure_open(connection)?;

        *state.stats.declares.entry(queue.clone()).or_insert(0) += 1;
        if state.faults.refused_declares.contains(queue) {
            return Err(QueueError::ProviderError {
                provider: "memory".to_string(),
                code: "PRECONDITION_FAILED".to_string(),
                message: format!("inequivalent arguments for queue '{}'", queue),
            });
        }

        state
            .queues
            .entry(queue.clone())
            .or_insert_with(|| MemoryQueue::new(durable));
        Ok(())
    }

    fn publish(&self, connection: u64, queue: &QueueName, body: Bytes) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.ensure_open(connection)?;
        state.stats.publish_attempts += 1;

        if state.faults.publish_failures > 0 {
            state.faults.publish_failures -= 1;
            state.drop_connection(
                connection,
                Some(QueueError::ConnectionFailed {
                    message: "connection reset by broker".to_string(),
                }),
            );
            drop(state);
            self.delivered.notify_all();
            return Err(QueueError::ConnectionFailed {
                message: "connection reset during publish".to_string(),
            });
        }

        state.queue_mut(queue)?.messages.push_back(StoredMessage {
            body,
            redelivered: false,
        });
        state.dispatch(queue);
        drop(state);
        self.delivered.notify_all();
        Ok(())
    }

    fn subscribe(&self, connection: u64, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.ensure_open(connection)?;

        state.queue_mut(queue)?.subscribers.push(Subscriber {
            connection,
            tag: tag.clone(),
        });
        state.dispatch(queue);
        drop(state);
        self.delivered.notify_all();
        Ok(())
    }

    fn settle(&self, connection: u64, tag: DeliveryTag, nack: Option<bool>) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.ensure_open(connection)?;

        let owned = state
            .unacked
            .get(&tag)
            .is_some_and(|unacked| unacked.connection == connection);
        if !owned {
            return Err(QueueError::UnknownDelivery { delivery_tag: tag });
        }

        let Some(unacked) = state.unacked.remove(&tag) else {
            return Err(QueueError::UnknownDelivery { delivery_tag: tag });
        };

        match nack {
            None => state.stats.acks.push(tag),
            Some(requeue) => {
                state.stats.nacks.push((tag, requeue));
                if requeue {
                    if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                        queue.messages.push_front(StoredMessage {
                            body: unacked.message.body,
                            redelivered: true,
                        });
                    }
                    state.dispatch(&unacked.queue);
                }
            }
        }

        drop(state);
        self.delivered.notify_all();
        Ok(())
    }

    fn fetch_one(&self, connection: u64, queue_name: &QueueName) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock();
        state.ensure_open(connection)?;

        let Some(message) = state.queue_mut(queue_name)?.messages.pop_front() else {
            return Ok(None);
        };

        let delivery_tag = state.allocate_tag();
        let delivery = Delivery {
            delivery_tag,
            consumer_tag: None,
            queue: queue_name.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
            delivered_at: Timestamp::now(),
        };
        state.unacked.insert(
            delivery_tag,
            Unacked {
                connection,
                queue: queue_name.clone(),
                message,
            },
        );
        Ok(Some(delivery))
    }

    fn next_delivery(&self, connection: u64, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            let entry = state
                .connections
                .get_mut(&connection)
                .filter(|entry| entry.open)
                .ok_or_else(|| QueueError::ChannelClosed {
                    message: format!("connection {} is closed", connection),
                })?;

            if let DeliverySink::Outbox(outbox) = &mut entry.sink {
                if let Some(delivery) = outbox.pop_front() {
                    return Ok(Some(delivery));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            state = match self.delivered.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

// ============================================================================
// Public broker
// ============================================================================

/// Failure the broker reports when a connection is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    AuthenticationFailed,
    ProtocolIncompatible,
    ConnectionLost,
}

impl InjectedFault {
    fn to_error(self) -> QueueError {
        match self {
            Self::AuthenticationFailed => QueueError::AuthenticationFailed {
                message: "ACCESS_REFUSED during close".to_string(),
            },
            Self::ProtocolIncompatible => QueueError::ProtocolIncompatible {
                message: "unexpected frame during close".to_string(),
            },
            Self::ConnectionLost => QueueError::ConnectionFailed {
                message: "socket closed during close handshake".to_string(),
            },
        }
    }
}

/// In-memory broker; clones share the same queues
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject connections that do not present these credentials
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        let broker = Self::new();
        broker.shared.lock().credentials = Some((username.into(), password.into()));
        broker
    }

    // ---- fault injection ----

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().faults.connect_failures = count;
    }

    /// Fail the next `count` publishes, closing the publishing connection each time
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.lock().faults.publish_failures = count;
    }

    /// Reject every declare of `queue` without closing the connection
    pub fn refuse_declares(&self, queue: &QueueName) {
        self.shared.lock().faults.refused_declares.insert(queue.clone());
    }

    /// Report `fault` from the next connection close
    pub fn fail_next_close(&self, fault: InjectedFault) {
        self.shared.lock().faults.close_failure = Some(fault);
    }

    /// Close every open connection as a broker restart would; returns how many were open
    pub fn drop_connections(&self) -> usize {
        let mut state = self.shared.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(id, _)| *id)
            .collect();

        for id in &open {
            state.drop_connection(
                *id,
                Some(QueueError::ConnectionFailed {
                    message: "connection forced closed by broker".to_string(),
                }),
            );
        }
        drop(state);
        self.shared.delivered.notify_all();
        open.len()
    }

    /// Enqueue a message as another publisher would, creating the queue if needed
    pub fn inject_message(&self, queue: &QueueName, body: impl Into<Bytes>) {
        let mut state = self.shared.lock();
        state
            .queues
            .entry(queue.clone())
            .or_insert_with(|| MemoryQueue::new(true))
            .messages
            .push_back(StoredMessage {
                body: body.into(),
                redelivered: false,
            });
        state.dispatch(queue);
        drop(state);
        self.shared.delivered.notify_all();
    }

    // ---- introspection ----

    /// How many declare requests the broker received for `queue`
    pub fn declare_count(&self, queue: &QueueName) -> u32 {
        self.shared
            .lock()
            .stats
            .declares
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &QueueName) -> bool {
        self.shared
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.durable)
    }

    /// Messages ready for delivery; delivered but unacknowledged ones are not counted
    pub fn queue_depth(&self, queue: &QueueName) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Bodies of the ready messages in `queue`, front first
    pub fn messages(&self, queue: &QueueName) -> Vec<Bytes> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn subscriptions(&self, queue: &QueueName) -> Vec<ConsumerTag> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.subscribers.iter().map(|s| s.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().stats.connect_attempts
    }

    /// Publishes received on open connections, failed ones included
    pub fn publish_attempts(&self) -> u32 {
        self.shared.lock().stats.publish_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.shared
            .lock()
            .connections
            .values()
            .filter(|entry| entry.open)
            .count()
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.shared.lock().stats.acks.clone()
    }

    /// Rejected deliveries with their requeue flag
    pub fn nacked(&self) -> Vec<(DeliveryTag, bool)> {
        self.shared.lock().stats.nacks.clone()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("InMemoryBroker")
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .field("unacked", &state.unacked.len())
            .finish()
    }
}

// ============================================================================
// Transport implementations
// ============================================================================

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

struct MemoryChannel {
    shared: Arc<Shared>,
    connection: u64,
}

impl BlockingBroker for InMemoryBroker {
    fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn BlockingConnection>, QueueError> {
        let id = self
            .shared
            .connect(params, DeliverySink::Outbox(VecDeque::new()))?;
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }
}

impl BlockingConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.is_open(self.id)
    }

    fn open_channel(&mut self) -> Result<Box<dyn BlockingChannel>, QueueError> {
        self.shared.lock().ensure_open(self.id)?;
        Ok(Box::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            connection: self.id,
        }))
    }

    fn close(&mut self) -> Result<(), QueueError> {
        self.shared.close(self.id)
    }
}

impl BlockingChannel for MemoryChannel {
    fn declare_queue(&mut self, queue: &QueueName, durable: bool) -> Result<(), QueueError> {
        self.shared.declare(self.connection, queue, durable)
    }

    fn publish(&mut self, queue: &QueueName, body: Bytes, _persistent: bool) -> Result<(), QueueError> {
        self.shared.publish(self.connection, queue, body)
    }

    fn subscribe(&mut self, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError> {
        self.shared.subscribe(self.connection, queue, tag)
    }

    fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.shared.settle(self.connection, tag, None)
    }

    fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.shared.settle(self.connection, tag, Some(requeue))
    }

    fn fetch_one(&mut self, queue: &QueueName) -> Result<Option<Delivery>, QueueError> {
        self.shared.fetch_one(self.connection, queue)
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        self.shared.next_delivery(self.connection, timeout)
    }
}

#[async_trait]
impl AsyncBroker for InMemoryBroker {
    async fn connect(
        &self,
        params: &ConnectionParams,
        events: TransportEvents,
    ) -> Result<Arc<dyn AsyncConnection>, QueueError> {
        let id = self.shared.connect(params, DeliverySink::Events(events))?;
        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }
}

#[async_trait]
impl AsyncConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AsyncChannel>, QueueError> {
        self.shared.lock().ensure_open(self.id)?;
        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            connection: self.id,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.shared.close(self.id)
    }
}

#[async_trait]
impl AsyncChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueName, durable: bool) -> Result<(), QueueError> {
        self.shared.declare(self.connection, queue, durable)
    }

    async fn publish(&self, queue: &QueueName, body: Bytes, _persistent: bool) -> Result<(), QueueError> {
        self.shared.publish(self.connection, queue, body)
    }

    async fn subscribe(&self, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError> {
        self.shared.subscribe(self.connection, queue, tag)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.shared.settle(self.connection, tag, None)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.shared.settle(self.connection, tag, Some(requeue))
    }
}
