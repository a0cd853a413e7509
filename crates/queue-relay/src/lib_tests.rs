//! Tests for the queue-relay library surface.

use super::*;
use std::sync::Arc;

#[test]
fn test_blocking_client_round_trip_through_root_exports() {
    let broker = InMemoryBroker::new();
    let mut client = BlockingQueueClient::connect(
        Arc::new(broker.clone()),
        &ConnectionParams::default(),
        ClientOptions::default(),
    )
    .unwrap();
    let events = QueueName::new("events").unwrap();

    client.publish(&events, "hello").unwrap();

    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.drain_queue(&events).unwrap(), vec![bytes::Bytes::from_static(b"hello")]);
}

#[test]
fn test_default_settings_select_blocking_broker_mode() {
    let settings = QueueSettings::default();

    assert!(settings.using_broker);
    assert!(!settings.event_loop_mode);
    assert_eq!(settings.retry.max_retries, DEFAULT_MAX_RETRIES);
    assert!(settings.validate().is_ok());
}
