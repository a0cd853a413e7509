//! AMQP 0-9-1 broker over `lapin`.
//!
//! Messages go through the default exchange with the queue name as routing
//! key. Each client connection uses a single channel, so delivery tags are
//! unique for the lifetime of that connection.
//!
//! The blocking family drives lapin's futures with
//! [`futures::executor::block_on`]; lapin runs its own I/O thread, so this
//! does not need a tokio runtime.

use crate::error::QueueError;
use crate::message::{ConsumerTag, Delivery, DeliveryTag, QueueName, Timestamp};
use crate::settings::ConnectionParams;
use crate::transport::{
    AsyncBroker, AsyncChannel, AsyncConnection, BlockingBroker, BlockingChannel,
    BlockingConnection, TransportEvents,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::executor::block_on;
use lapin::message::DeliveryResult;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

const PROVIDER: &str = "amqp";
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Build the `amqp://` URI for `params`.
///
/// Credentials and the virtual host are percent-encoded, so the default
/// virtual host `/` becomes `%2F`.
pub fn connection_uri(params: &ConnectionParams) -> String {
    let mut uri = format!(
        "amqp://{}:{}@{}:{}/{}?connection_timeout={}",
        urlencoding::encode(&params.username),
        urlencoding::encode(&params.password),
        params.host,
        params.port,
        urlencoding::encode(&params.virtual_host),
        params.connection_timeout_secs.saturating_mul(1000),
    );

    if let Some(heartbeat) = params.heartbeat_secs {
        uri.push_str(&format!("&heartbeat={}", heartbeat));
    }

    uri
}

/// Map a lapin error onto [`QueueError`]
pub fn to_queue_error(error: &lapin::Error) -> QueueError {
    match error {
        lapin::Error::IOError(e) => QueueError::ConnectionFailed {
            message: e.to_string(),
        },
        lapin::Error::InvalidConnectionState(_) => QueueError::ConnectionFailed {
            message: error.to_string(),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
            QueueError::ChannelClosed {
                message: error.to_string(),
            }
        }
        lapin::Error::InvalidProtocolVersion(_) => QueueError::ProtocolIncompatible {
            message: error.to_string(),
        },
        lapin::Error::ProtocolError(amqp_error) => {
            let message = amqp_error.to_string();
            if message.contains("ACCESS_REFUSED") {
                QueueError::AuthenticationFailed { message }
            } else {
                QueueError::ProviderError {
                    provider: PROVIDER.to_string(),
                    code: "protocol_error".to_string(),
                    message,
                }
            }
        }
        other => QueueError::ProviderError {
            provider: PROVIDER.to_string(),
            code: "client_error".to_string(),
            message: other.to_string(),
        },
    }
}

fn delivery_mode(persistent: bool) -> u8 {
    if persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    }
}

fn to_delivery(
    delivery: lapin::message::Delivery,
    queue: &QueueName,
    consumer_tag: Option<&ConsumerTag>,
) -> Delivery {
    Delivery {
        delivery_tag: DeliveryTag::new(delivery.delivery_tag),
        consumer_tag: consumer_tag.cloned(),
        queue: queue.clone(),
        body: Bytes::from(delivery.data),
        redelivered: delivery.redelivered,
        delivered_at: Timestamp::now(),
    }
}

async fn open_connection(params: &ConnectionParams) -> Result<Connection, QueueError> {
    debug!(host = %params.host, port = params.port, "Opening AMQP connection");
    let connection = Connection::connect(&connection_uri(params), ConnectionProperties::default())
        .await
        .map_err(|e| to_queue_error(&e))?;

    info!(host = %params.host, port = params.port, "AMQP connection open");
    Ok(connection)
}

async fn close_connection(connection: &Connection) -> Result<(), QueueError> {
    if !connection.status().connected() {
        return Ok(());
    }

    connection
        .close(REPLY_SUCCESS, "client closing")
        .await
        .map_err(|e| to_queue_error(&e))
}

async fn declare(channel: &Channel, queue: &QueueName, durable: bool) -> Result<(), QueueError> {
    let options = QueueDeclareOptions {
        durable,
        ..QueueDeclareOptions::default()
    };

    channel
        .queue_declare(queue.as_str(), options, FieldTable::default())
        .await
        .map(|_| ())
        .map_err(|e| to_queue_error(&e))
}

async fn publish(
    channel: &Channel,
    queue: &QueueName,
    body: &[u8],
    persistent: bool,
) -> Result<(), QueueError> {
    channel
        .basic_publish(
            "",
            queue.as_str(),
            BasicPublishOptions::default(),
            body,
            BasicProperties::default().with_delivery_mode(delivery_mode(persistent)),
        )
        .await
        .map_err(|e| to_queue_error(&e))?
        .await
        .map_err(|e| to_queue_error(&e))?;

    Ok(())
}

async fn start_consumer(
    channel: &Channel,
    queue: &QueueName,
    tag: &ConsumerTag,
) -> Result<lapin::Consumer, QueueError> {
    channel
        .basic_consume(
            queue.as_str(),
            tag.as_str(),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| to_queue_error(&e))
}

async fn ack(channel: &Channel, tag: DeliveryTag) -> Result<(), QueueError> {
    channel
        .basic_ack(tag.value(), BasicAckOptions::default())
        .await
        .map_err(|e| to_queue_error(&e))
}

async fn nack(channel: &Channel, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
    let options = BasicNackOptions {
        requeue,
        ..BasicNackOptions::default()
    };

    channel
        .basic_nack(tag.value(), options)
        .await
        .map_err(|e| to_queue_error(&e))
}

// ============================================================================
// Broker
// ============================================================================

/// Connects to an AMQP broker; implements both transport families
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AsyncBroker for AmqpBroker {
    async fn connect(
        &self,
        params: &ConnectionParams,
        events: TransportEvents,
    ) -> Result<Arc<dyn AsyncConnection>, QueueError> {
        let connection = open_connection(params).await?;

        let reporter = events.clone();
        connection.on_error(move |error| {
            let reason = to_queue_error(&error);
            warn!(error = %reason, "AMQP connection lost");
            reporter.closed(reason);
        });

        Ok(Arc::new(AmqpConnection { connection, events }))
    }
}

impl BlockingBroker for AmqpBroker {
    fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn BlockingConnection>, QueueError> {
        let connection = block_on(open_connection(params))?;
        Ok(Box::new(AmqpBlockingConnection { connection }))
    }
}

// ============================================================================
// Event-driven family
// ============================================================================

struct AmqpConnection {
    connection: Connection,
    events: TransportEvents,
}

#[async_trait]
impl AsyncConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AsyncChannel>, QueueError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| to_queue_error(&e))?;

        Ok(Arc::new(AmqpChannel {
            channel,
            events: self.events.clone(),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        close_connection(&self.connection).await
    }
}

struct AmqpChannel {
    channel: Channel,
    events: TransportEvents,
}

#[async_trait]
impl AsyncChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &QueueName, durable: bool) -> Result<(), QueueError> {
        declare(&self.channel, queue, durable).await
    }

    async fn publish(&self, queue: &QueueName, body: Bytes, persistent: bool) -> Result<(), QueueError> {
        publish(&self.channel, queue, &body, persistent).await
    }

    async fn subscribe(&self, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError> {
        let consumer = start_consumer(&self.channel, queue, tag).await?;

        let events = self.events.clone();
        let queue = queue.clone();
        let tag = tag.clone();
        consumer.set_delegate(move |delivery: DeliveryResult| {
            match delivery {
                Ok(Some(delivery)) => {
                    events.deliver(to_delivery(delivery, &queue, Some(&tag)));
                }
                Ok(None) => debug!(queue = %queue, consumer_tag = %tag, "Consumer cancelled"),
                Err(e) => {
                    events.closed(to_queue_error(&e));
                }
            }
            async {}
        });

        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        ack(&self.channel, tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        nack(&self.channel, tag, requeue).await
    }
}

// ============================================================================
// Blocking family
// ============================================================================

type Outbox = Result<Delivery, QueueError>;

struct AmqpBlockingConnection {
    connection: Connection,
}

impl BlockingConnection for AmqpBlockingConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn open_channel(&mut self) -> Result<Box<dyn BlockingChannel>, QueueError> {
        let channel =
            block_on(self.connection.create_channel()).map_err(|e| to_queue_error(&e))?;
        let (outbox_tx, outbox_rx) = mpsc::channel();

        Ok(Box::new(AmqpBlockingChannel {
            channel,
            outbox_tx,
            outbox_rx,
        }))
    }

    fn close(&mut self) -> Result<(), QueueError> {
        block_on(close_connection(&self.connection))
    }
}

/// Consumer deliveries are queued in an outbox until
/// [`BlockingChannel::next_delivery`] collects them
struct AmqpBlockingChannel {
    channel: Channel,
    outbox_tx: mpsc::Sender<Outbox>,
    outbox_rx: mpsc::Receiver<Outbox>,
}

impl AmqpBlockingChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.channel.status().connected() {
            Ok(())
        } else {
            Err(QueueError::ChannelClosed {
                message: "AMQP channel is closed".to_string(),
            })
        }
    }
}

impl BlockingChannel for AmqpBlockingChannel {
    fn declare_queue(&mut self, queue: &QueueName, durable: bool) -> Result<(), QueueError> {
        block_on(declare(&self.channel, queue, durable))
    }

    fn publish(&mut self, queue: &QueueName, body: Bytes, persistent: bool) -> Result<(), QueueError> {
        block_on(publish(&self.channel, queue, &body, persistent))
    }

    fn subscribe(&mut self, queue: &QueueName, tag: &ConsumerTag) -> Result<(), QueueError> {
        let consumer = block_on(start_consumer(&self.channel, queue, tag))?;

        let outbox = self.outbox_tx.clone();
        let queue = queue.clone();
        let tag = tag.clone();
        consumer.set_delegate(move |delivery: DeliveryResult| {
            let item = match delivery {
                Ok(Some(delivery)) => Some(Ok(to_delivery(delivery, &queue, Some(&tag)))),
                Ok(None) => None,
                Err(e) => Some(Err(to_queue_error(&e))),
            };
            if let Some(item) = item {
                // The receiver lives as long as the channel
                let _ = outbox.send(item);
            }
            async {}
        });

        Ok(())
    }

    fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        block_on(ack(&self.channel, tag))
    }

    fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        block_on(nack(&self.channel, tag, requeue))
    }

    fn fetch_one(&mut self, queue: &QueueName) -> Result<Option<Delivery>, QueueError> {
        let message = block_on(
            self.channel
                .basic_get(queue.as_str(), BasicGetOptions::default()),
        )
        .map_err(|e| to_queue_error(&e))?;

        Ok(message.map(|message| to_delivery(message.delivery, queue, None)))
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        if let Ok(item) = self.outbox_rx.try_recv() {
            return item.map(Some);
        }
        self.ensure_open()?;

        match self.outbox_rx.recv_timeout(timeout) {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }
}
