//! Shared helpers for queue-relay integration tests.

#![allow(dead_code)]

use queue_relay::{
    BlockingQueueClient, ClientOptions, ConnectionParams, ConnectionState, EventQueueClient,
    InMemoryBroker, QueueName,
};
use std::sync::Arc;
use std::time::Duration;

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name).expect("valid queue name")
}

pub fn blocking_client(broker: &InMemoryBroker) -> BlockingQueueClient {
    BlockingQueueClient::connect(
        Arc::new(broker.clone()),
        &ConnectionParams::default(),
        ClientOptions::default(),
    )
    .expect("in-memory broker accepts default credentials")
}

pub fn event_client(broker: &InMemoryBroker) -> EventQueueClient {
    EventQueueClient::start(
        Arc::new(broker.clone()),
        &ConnectionParams::default(),
        ClientOptions::default(),
    )
}

/// Wait for an open channel and for every command sent so far to be handled
pub async fn settle(client: &EventQueueClient) {
    client
        .wait_for_state(ConnectionState::Open)
        .await
        .expect("client reaches open state");
    client
        .declared_queues()
        .await
        .expect("client answers queries");
}

/// Poll `condition` on the (usually paused) tokio clock
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
