//! Process-level queue service.
//!
//! [`QueueService`] is the handle an application builds once at startup and
//! passes to every call site that publishes work. Depending on
//! [`QueueSettings`] it either talks to a broker through one of the two client
//! models or hands events straight to in-process workers.

use crate::blocking::BlockingQueueClient;
use crate::error::{ConfigurationError, QueueError};
use crate::event_loop::EventQueueClient;
use crate::message::QueueName;
use crate::metrics::MetricsSink;
use crate::retry::{RetryDecision, RetryEnvelope, RetryOutcome};
use crate::settings::{ClientOptions, QueueSettings};
use crate::transport::{AsyncBroker, BlockingBroker};
use bytes::Bytes;
use serde_json::Value;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Hands an event directly to the worker registered for a queue.
///
/// Used when the service runs without a broker.
pub trait WorkerLookup: Send + Sync {
    fn consume_direct(&self, queue: &QueueName, event: &Value) -> anyhow::Result<()>;
}

/// Processes an event in place of publishing it
pub type FallbackProcessor<'a> = &'a dyn Fn(&Value) -> anyhow::Result<()>;

/// Called with an event whose retries are exhausted
pub type FailureHandler<'a> = &'a dyn Fn(&RetryEnvelope);

/// How a [`QueueService`] delivers events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// No broker; events go to a fallback or the worker lookup
    Direct,
    /// Blocking client owned by a dedicated publisher thread
    Blocking,
    /// Event-driven client running on the tokio runtime
    EventDriven,
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Blocking => write!(f, "blocking"),
            Self::EventDriven => write!(f, "event-driven"),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builds a [`QueueService`] from settings and broker implementations
pub struct QueueServiceBuilder {
    settings: QueueSettings,
    blocking_broker: Option<Arc<dyn BlockingBroker>>,
    async_broker: Option<Arc<dyn AsyncBroker>>,
    worker_lookup: Option<Arc<dyn WorkerLookup>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl QueueServiceBuilder {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            blocking_broker: None,
            async_broker: None,
            worker_lookup: None,
            metrics: None,
        }
    }

    /// Broker used when `event_loop_mode` is off
    pub fn with_blocking_broker(mut self, broker: Arc<dyn BlockingBroker>) -> Self {
        self.blocking_broker = Some(broker);
        self
    }

    /// Broker used when `event_loop_mode` is on
    pub fn with_async_broker(mut self, broker: Arc<dyn AsyncBroker>) -> Self {
        self.async_broker = Some(broker);
        self
    }

    pub fn with_worker_lookup(mut self, lookup: Arc<dyn WorkerLookup>) -> Self {
        self.worker_lookup = Some(lookup);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the settings and start the selected backend.
    ///
    /// The blocking backend connects before returning, so connection errors
    /// surface here. The event-driven backend must be built inside a tokio
    /// runtime and connects in the background.
    pub fn build(self) -> Result<QueueService, QueueError> {
        self.settings.validate()?;

        let mut options = ClientOptions::from_settings(&self.settings);
        if let Some(metrics) = self.metrics {
            options = options.with_metrics(metrics);
        }

        let backend = if !self.settings.using_broker {
            Backend::Direct
        } else if self.settings.event_loop_mode {
            let broker = self.async_broker.ok_or_else(|| missing("async_broker"))?;
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(ConfigurationError::Invalid {
                    message: "event loop mode requires a running tokio runtime".to_string(),
                }
                .into());
            }
            Backend::EventDriven(EventQueueClient::start(
                broker,
                &self.settings.connection,
                options,
            ))
        } else {
            let broker = self.blocking_broker.ok_or_else(|| missing("blocking_broker"))?;
            let client = BlockingQueueClient::connect(broker, &self.settings.connection, options)?;
            Backend::Blocking(PublisherThread::spawn(client)?)
        };

        let service = QueueService {
            backend,
            worker_lookup: self.worker_lookup,
            max_retries: self.settings.retry.max_retries,
        };
        info!(mode = %service.mode(), "Queue service started");
        Ok(service)
    }
}

fn missing(key: &str) -> QueueError {
    ConfigurationError::Missing {
        key: key.to_string(),
    }
    .into()
}

// ============================================================================
// Service
// ============================================================================

enum Backend {
    Direct,
    Blocking(PublisherThread),
    EventDriven(EventQueueClient),
}

/// Explicit handle for publishing and retrying events
pub struct QueueService {
    backend: Backend,
    worker_lookup: Option<Arc<dyn WorkerLookup>>,
    max_retries: u32,
}

impl QueueService {
    pub fn builder(settings: QueueSettings) -> QueueServiceBuilder {
        QueueServiceBuilder::new(settings)
    }

    pub fn mode(&self) -> ServiceMode {
        match self.backend {
            Backend::Direct => ServiceMode::Direct,
            Backend::Blocking(_) => ServiceMode::Blocking,
            Backend::EventDriven(_) => ServiceMode::EventDriven,
        }
    }

    /// The event-driven client, for registering consumers
    pub fn event_client(&self) -> Option<&EventQueueClient> {
        match &self.backend {
            Backend::EventDriven(client) => Some(client),
            _ => None,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Publish `event` to `queue`.
    ///
    /// With a broker the event is JSON-published, with one reconnect and retry
    /// on a connection failure. Without one it goes to `fallback` if given,
    /// otherwise to the worker lookup.
    pub fn queue_publish(
        &self,
        queue: &QueueName,
        event: &Value,
        fallback: Option<FallbackProcessor<'_>>,
    ) -> Result<(), QueueError> {
        match &self.backend {
            Backend::Blocking(thread) => {
                let body = Bytes::from(serde_json::to_vec(event)?);
                thread.publish(queue, body)
            }
            Backend::EventDriven(client) => client.json_publish(queue, event),
            Backend::Direct => self.dispatch_direct(queue, event, fallback),
        }
    }

    fn dispatch_direct(
        &self,
        queue: &QueueName,
        event: &Value,
        fallback: Option<FallbackProcessor<'_>>,
    ) -> Result<(), QueueError> {
        let result = match (fallback, &self.worker_lookup) {
            (Some(process), _) => process(event),
            (None, Some(lookup)) => lookup.consume_direct(queue, event),
            (None, None) => return Err(missing("worker_lookup")),
        };

        result.map_err(|source| QueueError::DirectDispatch {
            queue: queue.to_string(),
            source,
        })
    }

    /// Record a failure of `event` and republish it, up to the configured limit
    pub fn retry_event(
        &self,
        queue: &QueueName,
        event: &mut RetryEnvelope,
        failure_handler: Option<FailureHandler<'_>>,
    ) -> RetryOutcome {
        self.retry_event_with_limit(queue, event, self.max_retries, failure_handler)
    }

    /// Record a failure of `event` and republish it unless it has failed more
    /// than `max_retries` times.
    ///
    /// A failed republish is logged and not retried.
    pub fn retry_event_with_limit(
        &self,
        queue: &QueueName,
        event: &mut RetryEnvelope,
        max_retries: u32,
        failure_handler: Option<FailureHandler<'_>>,
    ) -> RetryOutcome {
        match event.record_failure(max_retries) {
            RetryDecision::Exhausted => {
                error!(
                    queue = %queue,
                    failed_tries = event.failed_tries,
                    max_retries,
                    "Event retries exhausted"
                );
                if let Some(handler) = failure_handler {
                    handler(event);
                }
                RetryOutcome::Exhausted
            }
            RetryDecision::Retry => {
                // Without a broker a retry is dropped rather than run inline
                let skip_direct = |_: &Value| -> anyhow::Result<()> { Ok(()) };
                let result = event
                    .to_value()
                    .and_then(|value| self.queue_publish(queue, &value, Some(&skip_direct)));

                match result {
                    Ok(()) => {
                        debug!(
                            queue = %queue,
                            failed_tries = event.failed_tries,
                            "Republished failed event"
                        );
                        RetryOutcome::Republished
                    }
                    Err(e) => {
                        warn!(
                            queue = %queue,
                            failed_tries = event.failed_tries,
                            error = %e,
                            "Failed to republish event"
                        );
                        RetryOutcome::RepublishFailed
                    }
                }
            }
        }
    }

    /// Remove every message currently in `queue`.
    ///
    /// Only the blocking backend can drain.
    pub fn drain_queue(&self, queue: &QueueName) -> Result<Vec<Bytes>, QueueError> {
        match &self.backend {
            Backend::Blocking(thread) => thread.drain(queue),
            _ => Err(ConfigurationError::Invalid {
                message: format!("draining is not supported in {} mode", self.mode()),
            }
            .into()),
        }
    }

    /// Close the broker connection.
    ///
    /// Later publishes fail with [`QueueError::ClientShutdown`].
    pub fn shutdown(&self) -> Result<(), QueueError> {
        match &self.backend {
            Backend::Direct => Ok(()),
            Backend::Blocking(thread) => thread.close(),
            Backend::EventDriven(client) => {
                client.request_close();
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("mode", &self.mode())
            .field("worker_lookup", &self.worker_lookup.is_some())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

// ============================================================================
// Publisher thread
// ============================================================================

type Reply<T> = mpsc::Sender<Result<T, QueueError>>;

enum Job {
    Publish {
        queue: QueueName,
        body: Bytes,
        reply: Reply<()>,
    },
    Drain {
        queue: QueueName,
        reply: Reply<Vec<Bytes>>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Single owner of a [`BlockingQueueClient`].
///
/// Callers on any thread submit jobs over a channel and wait for the reply,
/// so the client's channel only ever sees one operation at a time.
struct PublisherThread {
    jobs: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PublisherThread {
    fn spawn(client: BlockingQueueClient) -> Result<Self, QueueError> {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("queue-relay-publisher".to_string())
            .spawn(move || run_publisher(client, jobs_rx))?;

        Ok(Self {
            jobs: Some(jobs_tx),
            handle: Some(handle),
        })
    }

    fn request<T>(&self, make_job: impl FnOnce(Reply<T>) -> Job) -> Result<T, QueueError> {
        let jobs = self.jobs.as_ref().ok_or(QueueError::ClientShutdown)?;
        let (reply_tx, reply_rx) = mpsc::channel();

        jobs.send(make_job(reply_tx))
            .map_err(|_| QueueError::ClientShutdown)?;
        reply_rx.recv().map_err(|_| QueueError::ClientShutdown)?
    }

    fn publish(&self, queue: &QueueName, body: Bytes) -> Result<(), QueueError> {
        self.request(|reply| Job::Publish {
            queue: queue.clone(),
            body,
            reply,
        })
    }

    fn drain(&self, queue: &QueueName) -> Result<Vec<Bytes>, QueueError> {
        self.request(|reply| Job::Drain {
            queue: queue.clone(),
            reply,
        })
    }

    fn close(&self) -> Result<(), QueueError> {
        self.request(|reply| Job::Close { reply })
    }
}

impl Drop for PublisherThread {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Queue publisher thread panicked");
            }
        }
    }
}

fn run_publisher(mut client: BlockingQueueClient, jobs: mpsc::Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Publish { queue, body, reply } => {
                let _ = reply.send(client.publish_with_retry(&queue, body));
            }
            Job::Drain { queue, reply } => {
                let _ = reply.send(client.drain_queue(&queue));
            }
            Job::Close { reply } => {
                let _ = reply.send(client.close());
                debug!("Queue publisher thread stopped");
                return;
            }
        }
    }

    if let Err(e) = client.close() {
        warn!(error = %e, "Failed to close queue client");
    }
}
