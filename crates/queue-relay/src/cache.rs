//! Per-connection record of queues already declared on the broker.

use crate::message::QueueName;
use std::collections::HashSet;

/// Queues declared on the current connection.
///
/// Queue declaration is idempotent on the broker but costs a round trip, so
/// each queue is declared once per connection. The cache must be cleared
/// whenever the connection is replaced.
#[derive(Debug, Default, Clone)]
pub struct QueueDeclarationCache {
    declared: HashSet<QueueName>,
}

impl QueueDeclarationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, queue: &QueueName) -> bool {
        self.declared.contains(queue)
    }

    /// Record a successful declaration; returns false if it was already recorded
    pub fn mark_declared(&mut self, queue: QueueName) -> bool {
        self.declared.insert(queue)
    }

    pub fn clear(&mut self) {
        self.declared.clear();
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Declared queue names in sorted order
    pub fn names(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = self.declared.iter().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
