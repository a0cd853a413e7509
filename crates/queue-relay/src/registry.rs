//! Registered consumers and their subscriptions.
//!
//! A consumer is registered once and lives for as long as the client does.
//! Subscriptions are per connection: each time a consumer is (re)subscribed it
//! gets a fresh [`ConsumerTag`], and all tags are dropped when the connection
//! goes away so that replay can start from a clean slate.

use crate::message::{ConsumerId, ConsumerTag, Delivery, QueueName};
use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Callback run for every message delivered to a consumer.
///
/// Returning `Ok` acknowledges the delivery; returning `Err` rejects it.
pub type ConsumerHandler = Arc<dyn Fn(&Delivery) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a raw-body callback
pub fn wrap_handler<F>(handler: F) -> ConsumerHandler
where
    F: Fn(&Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Wrap a callback that takes the body decoded as JSON.
///
/// A body that does not decode as `T` counts as a handler failure.
pub fn wrap_json_handler<T, F>(handler: F) -> ConsumerHandler
where
    T: DeserializeOwned + 'static,
    F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |delivery: &Delivery| {
        let payload: T = serde_json::from_slice(&delivery.body).with_context(|| {
            format!(
                "delivery {} on queue '{}' is not valid JSON for this consumer",
                delivery.delivery_tag, delivery.queue
            )
        })?;
        handler(payload)
    })
}

/// Run a handler, turning a panic into an ordinary failure
pub(crate) fn invoke_handler(handler: &ConsumerHandler, delivery: &Delivery) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(|| handler(delivery))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow!("consumer panicked: {message}"))
        }
    }
}

struct RegisteredConsumer {
    id: ConsumerId,
    handler: ConsumerHandler,
    tag: Option<ConsumerTag>,
}

/// All consumers registered on one client
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<QueueName, Vec<RegisteredConsumer>>,
    active: HashMap<ConsumerTag, (QueueName, ConsumerId)>,
    /// Registration order, used for replay
    order: Vec<(QueueName, ConsumerId)>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer; it stays registered for the life of the client
    pub fn register(&mut self, queue: QueueName, id: ConsumerId, handler: ConsumerHandler) {
        self.consumers
            .entry(queue.clone())
            .or_default()
            .push(RegisteredConsumer {
                id,
                handler,
                tag: None,
            });
        self.order.push((queue, id));
    }

    /// Record that consumer `id` is subscribed under `tag`.
    ///
    /// Any tag the consumer held before is retired. Returns false if `id` is
    /// not registered.
    pub fn activate(&mut self, id: ConsumerId, tag: ConsumerTag) -> bool {
        let Some((queue, consumer)) = self.find_mut(id) else {
            return false;
        };

        let queue = queue.clone();
        let previous = consumer.tag.replace(tag.clone());
        if let Some(previous) = previous {
            self.active.remove(&previous);
        }
        self.active.insert(tag, (queue, id));
        true
    }

    /// Find the consumer a delivery was addressed to
    pub fn lookup(&self, tag: &ConsumerTag) -> Option<(QueueName, ConsumerHandler)> {
        let (queue, id) = self.active.get(tag)?;
        let consumer = self.consumers.get(queue)?.iter().find(|c| c.id == *id)?;
        Some((queue.clone(), Arc::clone(&consumer.handler)))
    }

    /// Forget every subscription; registrations are kept
    pub fn invalidate_tags(&mut self) {
        self.active.clear();
        for consumer in self.consumers.values_mut().flat_map(|c| c.iter_mut()) {
            consumer.tag = None;
        }
    }

    /// Every registered consumer in registration order
    pub fn replay_plan(&self) -> Vec<(QueueName, ConsumerId)> {
        self.order.clone()
    }

    pub fn current_tag(&self, id: ConsumerId) -> Option<&ConsumerTag> {
        self.consumers
            .values()
            .flat_map(|c| c.iter())
            .find(|c| c.id == id)
            .and_then(|c| c.tag.as_ref())
    }

    /// Subscriptions on the current connection, sorted by queue
    pub fn active_tags(&self) -> Vec<(QueueName, ConsumerTag)> {
        let mut tags: Vec<(QueueName, ConsumerTag)> = self
            .active
            .iter()
            .map(|(tag, (queue, _))| (queue.clone(), tag.clone()))
            .collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
        tags
    }

    pub fn consumers_for(&self, queue: &QueueName) -> usize {
        self.consumers.get(queue).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn find_mut(&mut self, id: ConsumerId) -> Option<(&QueueName, &mut RegisteredConsumer)> {
        self.consumers.iter_mut().find_map(|(queue, consumers)| {
            consumers
                .iter_mut()
                .find(|c| c.id == id)
                .map(|consumer| (queue, consumer))
        })
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("consumers", &self.order.len())
            .field("active", &self.active.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
