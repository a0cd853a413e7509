//! Event-driven queue client.
//!
//! [`EventQueueClient`] is a cheap, cloneable handle. All connection state is
//! owned by a single task spawned on the current tokio runtime; handles talk
//! to it over a command channel, so operations submitted from one handle are
//! applied in submission order.
//!
//! The client never blocks its caller:
//! - Work submitted before the channel is open is queued and run, in order,
//!   once it opens.
//! - An unexpected connection loss schedules a reconnect after the configured
//!   delay. Connect failures, authentication included, schedule another one.
//! - Every registered consumer is subscribed again on each new channel.

use crate::cache::QueueDeclarationCache;
use crate::error::QueueError;
use crate::message::{ConsumerId, ConsumerTag, Delivery, QueueName};
use crate::metrics::MetricEvent;
use crate::registry::{
    invoke_handler, wrap_handler, wrap_json_handler, ConsumerHandler, ConsumerRegistry,
};
use crate::settings::{ClientOptions, ConnectionParams};
use crate::transport::{
    AsyncBroker, AsyncChannel, AsyncConnection, ConnectionState, TransportEvent, TransportEvents,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Requests from handles to the connection task
enum Command {
    Publish {
        queue: QueueName,
        body: Bytes,
        /// Reconnect and send once more after a connection-level failure
        retry_on_connection_error: bool,
    },
    Register {
        queue: QueueName,
        id: ConsumerId,
        handler: ConsumerHandler,
    },
    Reconnect,
    DeclaredQueues {
        reply: oneshot::Sender<Vec<QueueName>>,
    },
    ActiveTags {
        reply: oneshot::Sender<Vec<(QueueName, ConsumerTag)>>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Completions of work the connection task started in the background
enum LoopEvent {
    Connected {
        generation: u64,
        result: Result<Arc<dyn AsyncConnection>, QueueError>,
    },
    ChannelOpened {
        generation: u64,
        result: Result<Arc<dyn AsyncChannel>, QueueError>,
    },
    ReconnectDue,
}

/// Work that needs a declared queue
enum QueueAction {
    Publish { body: Bytes, retried: bool },
    Subscribe { id: ConsumerId },
}

struct PendingAction {
    queue: QueueName,
    action: QueueAction,
}

/// Handle to an event-driven queue client
#[derive(Clone)]
pub struct EventQueueClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl EventQueueClient {
    /// Spawn the connection task and start connecting.
    ///
    /// Must be called from within a tokio runtime. The task runs until
    /// [`Self::close`] is called or every handle has been dropped.
    pub fn start(broker: Arc<dyn AsyncBroker>, params: &ConnectionParams, options: ClientOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ConnectionActor::new(broker, params.clone(), options, commands_rx, state_tx);
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    fn send(&self, command: Command) -> Result<(), QueueError> {
        self.commands
            .send(command)
            .map_err(|_| QueueError::ClientShutdown)
    }

    /// Queue a persistent message for publishing.
    ///
    /// Returns once the message is handed to the connection task; broker
    /// errors are logged there.
    pub fn publish(&self, queue: &QueueName, body: impl Into<Bytes>) -> Result<(), QueueError> {
        self.send(Command::Publish {
            queue: queue.clone(),
            body: body.into(),
            retry_on_connection_error: false,
        })
    }

    /// Serialize `payload` as JSON and queue it for publishing.
    ///
    /// A connection-level publish failure triggers one reconnect and one more
    /// attempt on the new channel.
    pub fn json_publish<T>(&self, queue: &QueueName, payload: &T) -> Result<(), QueueError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)?;
        self.send(Command::Publish {
            queue: queue.clone(),
            body: body.into(),
            retry_on_connection_error: true,
        })
    }

    /// Register `handler` for `queue`.
    ///
    /// It is subscribed now if the channel is open, and again on every new
    /// channel. A failing handler has its delivery rejected and the failure
    /// logged.
    pub fn register_consumer<F>(&self, queue: &QueueName, handler: F) -> Result<ConsumerId, QueueError>
    where
        F: Fn(&Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(queue, wrap_handler(handler))
    }

    /// Register a handler that receives each message body decoded as JSON
    pub fn register_json_consumer<T, F>(&self, queue: &QueueName, handler: F) -> Result<ConsumerId, QueueError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(queue, wrap_json_handler(handler))
    }

    fn register_handler(&self, queue: &QueueName, handler: ConsumerHandler) -> Result<ConsumerId, QueueError> {
        let id = ConsumerId::new();
        self.send(Command::Register {
            queue: queue.clone(),
            id,
            handler,
        })?;
        Ok(id)
    }

    /// Drop the current connection and connect again right away
    pub fn reconnect(&self) -> Result<(), QueueError> {
        self.send(Command::Reconnect)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), QueueError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| QueueError::ClientShutdown)
    }

    /// Queues declared on the current connection
    pub async fn declared_queues(&self) -> Result<Vec<QueueName>, QueueError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::DeclaredQueues { reply })?;
        response.await.map_err(|_| QueueError::ClientShutdown)
    }

    /// Subscriptions on the current channel
    pub async fn active_consumer_tags(&self) -> Result<Vec<(QueueName, ConsumerTag)>, QueueError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ActiveTags { reply })?;
        response.await.map_err(|_| QueueError::ClientShutdown)
    }

    /// Close the connection and stop the connection task.
    ///
    /// Work still waiting for a channel is dropped.
    pub async fn close(&self) -> Result<(), QueueError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Close { reply: Some(reply) })?;
        done.await.map_err(|_| QueueError::ClientShutdown)
    }

    /// Ask the connection task to close without waiting for it
    pub fn request_close(&self) {
        if self.send(Command::Close { reply: None }).is_err() {
            debug!("Event-driven queue client already stopped");
        }
    }
}

impl std::fmt::Debug for EventQueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueueClient")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Connection task
// ============================================================================

struct ConnectionActor {
    broker: Arc<dyn AsyncBroker>,
    params: ConnectionParams,
    options: ClientOptions,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    /// Identifies the current connection attempt; results and events from
    /// older attempts are ignored
    generation: u64,
    connection: Option<Arc<dyn AsyncConnection>>,
    channel: Option<Arc<dyn AsyncChannel>>,
    declared: QueueDeclarationCache,
    consumers: ConsumerRegistry,
    pending: VecDeque<PendingAction>,
    reconnect_attempt: u32,
    reconnect_scheduled: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    loop_rx: mpsc::UnboundedReceiver<LoopEvent>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
}

impl ConnectionActor {
    fn new(
        broker: Arc<dyn AsyncBroker>,
        params: ConnectionParams,
        options: ClientOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        Self {
            broker,
            params,
            options,
            state: ConnectionState::Disconnected,
            state_tx,
            generation: 0,
            connection: None,
            channel: None,
            declared: QueueDeclarationCache::new(),
            consumers: ConsumerRegistry::new(),
            pending: VecDeque::new(),
            reconnect_attempt: 0,
            reconnect_scheduled: false,
            commands,
            loop_tx,
            loop_rx,
            transport_tx,
            transport_rx,
        }
    }

    async fn run(mut self) {
        self.connect();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.loop_rx.recv() => self.handle_loop_event(event).await,
                Some((generation, event)) = self.transport_rx.recv() => {
                    self.handle_transport_event(generation, event).await
                }
            }
        }

        debug!("Event-driven queue client task stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Connection state changed");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish {
                queue,
                body,
                retry_on_connection_error,
            } => {
                self.ensure_queue(
                    queue,
                    QueueAction::Publish {
                        body,
                        retried: !retry_on_connection_error,
                    },
                )
                .await
            }
            Command::Register { queue, id, handler } => {
                self.consumers.register(queue.clone(), id, handler);
                info!(queue = %queue, consumer_id = %id, "Registered consumer");
                if self.state == ConnectionState::Open {
                    self.ensure_queue(queue, QueueAction::Subscribe { id }).await;
                }
            }
            Command::Reconnect => self.reconnect().await,
            Command::DeclaredQueues { reply } => {
                let _ = reply.send(self.declared.names());
            }
            Command::ActiveTags { reply } => {
                let _ = reply.send(self.consumers.active_tags());
            }
            // handled by the run loop
            Command::Close { .. } => {}
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Start a connection attempt in the background
    fn connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        info!(
            host = %self.params.host,
            port = self.params.port,
            generation = generation,
            "Connecting event-driven queue client"
        );

        let broker = Arc::clone(&self.broker);
        let params = self.params.clone();
        let events = TransportEvents::new(generation, self.transport_tx.clone());
        let loop_tx = self.loop_tx.clone();

        tokio::spawn(async move {
            let result = broker.connect(&params, events).await;
            let _ = loop_tx.send(LoopEvent::Connected { generation, result });
        });
    }

    async fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Connected { generation, result } => self.on_connected(generation, result),
            LoopEvent::ChannelOpened { generation, result } => {
                self.on_channel_opened(generation, result).await
            }
            LoopEvent::ReconnectDue => {
                self.reconnect_scheduled = false;
                if self.state == ConnectionState::Disconnected {
                    self.connect();
                } else {
                    debug!(state = %self.state, "Reconnect timer fired while not disconnected");
                }
            }
        }
    }

    fn on_connected(&mut self, generation: u64, result: Result<Arc<dyn AsyncConnection>, QueueError>) {
        if generation != self.generation {
            if let Ok(stale) = result {
                debug!(generation = generation, "Closing connection from a superseded attempt");
                tokio::spawn(async move {
                    let _ = stale.close().await;
                });
            }
            return;
        }

        match result {
            Ok(connection) => {
                self.connection = Some(Arc::clone(&connection));
                let loop_tx = self.loop_tx.clone();
                tokio::spawn(async move {
                    let result = connection.open_channel().await;
                    let _ = loop_tx.send(LoopEvent::ChannelOpened { generation, result });
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to broker");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn on_channel_opened(&mut self, generation: u64, result: Result<Arc<dyn AsyncChannel>, QueueError>) {
        if generation != self.generation {
            return;
        }

        match result {
            Ok(channel) => {
                self.channel = Some(channel);
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Open);
                info!(
                    pending = self.pending.len(),
                    consumers = self.consumers.len(),
                    "Event-driven queue client connected"
                );

                let pending = std::mem::take(&mut self.pending);
                for PendingAction { queue, action } in pending {
                    self.ensure_queue(queue, action).await;
                }

                self.replay_consumers().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to open channel");
                self.teardown().await;
                self.schedule_reconnect();
            }
        }
    }

    /// Subscribe every registered consumer on the new channel
    async fn replay_consumers(&mut self) {
        for (queue, id) in self.consumers.replay_plan() {
            if self.consumers.current_tag(id).is_some() {
                continue;
            }
            self.ensure_queue(queue, QueueAction::Subscribe { id }).await;
        }
    }

    /// Forget the channel, declarations and subscriptions, and close the connection
    async fn teardown(&mut self) {
        self.generation += 1;
        self.channel = None;
        self.declared.clear();
        self.consumers.invalidate_tags();
        self.set_state(ConnectionState::Disconnected);

        if let Some(connection) = self.connection.take() {
            match connection.close().await {
                Ok(()) => {}
                Err(e) if e.is_ignorable_on_shutdown() => {
                    warn!(error = %e, "Ignoring broker error while closing connection");
                }
                Err(e) => {
                    debug!(error = %e, "Connection did not close cleanly");
                }
            }
        }
    }

    async fn reconnect(&mut self) {
        info!("Reconnecting event-driven queue client");
        self.teardown().await;
        self.connect();
    }

    /// React to the connection going away without being asked to
    async fn connection_lost(&mut self, reason: QueueError) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        warn!(error = %reason, "Lost connection to broker, reconnecting");
        self.teardown().await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_scheduled {
            return;
        }
        self.reconnect_scheduled = true;

        let delay = self.options.reconnect.delay_for(self.reconnect_attempt);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnect_attempt,
            "Scheduling reconnect"
        );

        let loop_tx = self.loop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = loop_tx.send(LoopEvent::ReconnectDue);
        });
    }

    async fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                count = self.pending.len(),
                "Dropping queued work on shutdown"
            );
            self.pending.clear();
        }
        self.teardown().await;
        info!("Event-driven queue client closed");
    }

    // ========================================================================
    // Queue operations
    // ========================================================================

    /// Run `action` once `queue` is declared on the current channel, deferring
    /// it until a channel opens if there is none
    async fn ensure_queue(&mut self, queue: QueueName, action: QueueAction) {
        let Some(channel) = self.channel.clone() else {
            self.defer(queue, action);
            return;
        };

        if !self.declared.contains(&queue) {
            if let Err(e) = channel.declare_queue(&queue, true).await {
                if e.is_connection_error() {
                    warn!(queue = %queue, error = %e, "Failed to declare queue, connection lost");
                    self.defer(queue, action);
                    self.connection_lost(e).await;
                } else {
                    error!(queue = %queue, error = %e, "Failed to declare queue, dropping work");
                }
                return;
            }
            self.declared.mark_declared(queue.clone());
            debug!(queue = %queue, "Declared queue");
        }

        self.run_action(channel, queue, action).await;
    }

    /// Hold `action` until the next channel opens.
    ///
    /// Subscriptions are not held: every registered consumer is replayed on
    /// the next channel anyway.
    fn defer(&mut self, queue: QueueName, action: QueueAction) {
        match action {
            QueueAction::Subscribe { .. } => {
                debug!(queue = %queue, "Subscription will be made when the channel opens");
            }
            action => {
                debug!(queue = %queue, "Channel not open, queueing work");
                self.pending.push_back(PendingAction { queue, action });
            }
        }
    }

    async fn run_action(&mut self, channel: Arc<dyn AsyncChannel>, queue: QueueName, action: QueueAction) {
        match action {
            QueueAction::Publish { body, retried } => {
                match channel.publish(&queue, body.clone(), true).await {
                    Ok(()) => self.options.metrics.increment(MetricEvent::Published, &queue),
                    Err(e) if e.is_connection_error() && !retried => {
                        warn!(
                            queue = %queue,
                            error = %e,
                            "Failed to publish, reconnecting and sending again"
                        );
                        self.pending.push_back(PendingAction {
                            queue,
                            action: QueueAction::Publish {
                                body,
                                retried: true,
                            },
                        });
                        self.reconnect().await;
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Dropping message after failed publish");
                    }
                }
            }
            QueueAction::Subscribe { id } => {
                let tag = ConsumerTag::generate(&queue);
                match channel.subscribe(&queue, &tag).await {
                    Ok(()) => {
                        self.consumers.activate(id, tag.clone());
                        debug!(queue = %queue, consumer_tag = %tag, "Subscribed consumer");
                    }
                    Err(e) if e.is_connection_error() => {
                        warn!(queue = %queue, error = %e, "Failed to subscribe consumer");
                        self.connection_lost(e).await;
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Failed to subscribe consumer");
                    }
                }
            }
        }
    }

    // ========================================================================
    // Broker events
    // ========================================================================

    async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation {
            debug!(generation = generation, "Ignoring event from a superseded connection");
            return;
        }

        match event {
            TransportEvent::Closed(reason) => self.connection_lost(reason).await,
            TransportEvent::Delivery(delivery) => self.dispatch(delivery).await,
        }
    }

    async fn dispatch(&mut self, delivery: Delivery) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        let delivery_tag = delivery.delivery_tag;

        let target = delivery
            .consumer_tag
            .as_ref()
            .and_then(|tag| self.consumers.lookup(tag));
        let Some((queue, handler)) = target else {
            warn!(
                delivery_tag = %delivery_tag,
                queue = %delivery.queue,
                "Delivery for unknown consumer, returning it to the queue"
            );
            if let Err(e) = channel.nack(delivery_tag, true).await {
                warn!(error = %e, "Failed to return delivery");
            }
            return;
        };

        match invoke_handler(&handler, &delivery) {
            Ok(()) => match channel.ack(delivery_tag).await {
                Ok(()) => self.options.metrics.increment(MetricEvent::Acked, &queue),
                Err(e) => warn!(queue = %queue, error = %e, "Failed to acknowledge delivery"),
            },
            Err(source) => {
                let requeue = self.options.requeue_on_failure;
                error!(
                    queue = %queue,
                    delivery_tag = %delivery_tag,
                    requeue = requeue,
                    error = format!("{:#}", source),
                    "Consumer failed, rejecting delivery"
                );
                match channel.nack(delivery_tag, requeue).await {
                    Ok(()) => self.options.metrics.increment(MetricEvent::Nacked, &queue),
                    Err(e) => warn!(queue = %queue, error = %e, "Failed to reject delivery"),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "event_loop_tests.rs"]
mod tests;
