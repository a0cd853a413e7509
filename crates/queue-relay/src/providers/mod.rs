//! Broker implementations.
//!
//! Every broker implements both transport families from [`crate::transport`].

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::{InMemoryBroker, InjectedFault};

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
