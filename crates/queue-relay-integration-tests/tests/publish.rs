//! Integration tests for publishing through both client models.

mod common;

use bytes::Bytes;
use common::{blocking_client, event_client, eventually, queue, settle};
use queue_relay::{InMemoryBroker, QueueError};
use serde_json::json;

/// Verify that a queue is declared once per connection no matter how often it is used
#[test]
fn test_blocking_declares_queue_once_per_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut client = blocking_client(&broker);
    let events = queue("events");

    // Act
    for n in 0..5 {
        client.json_publish(&events, &json!({ "n": n })).unwrap();
    }
    client.reconnect().unwrap();
    client.publish(&events, "after reconnect").unwrap();

    // Assert
    assert_eq!(broker.declare_count(&events), 2);
    assert_eq!(broker.queue_depth(&events), 6);
}

/// Verify that a JSON publish recovers from one lost connection
#[test]
fn test_blocking_json_publish_retries_once() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut client = blocking_client(&broker);
    let signups = queue("signups");
    broker.fail_next_publishes(1);

    // Act
    client.json_publish(&signups, &json!({ "user_id": 1 })).unwrap();

    // Assert
    assert_eq!(broker.publish_attempts(), 2);
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(
        broker.messages(&signups),
        vec![Bytes::from_static(br#"{"user_id":1}"#)]
    );
}

/// Verify that a second consecutive failure is returned without a third attempt
#[test]
fn test_blocking_json_publish_gives_up_after_second_failure() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut client = blocking_client(&broker);
    broker.fail_next_publishes(2);

    // Act
    let result = client.json_publish(&queue("signups"), &json!({ "user_id": 1 }));

    // Assert
    assert!(matches!(result, Err(QueueError::ConnectionFailed { .. })));
    assert_eq!(broker.publish_attempts(), 2);
    assert_eq!(broker.connect_attempts(), 2);
}

/// Verify that the event-driven client publishes in submission order once connected
#[tokio::test(start_paused = true)]
async fn test_event_driven_publishes_in_order() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = event_client(&broker);
    let events = queue("events");

    // Act
    for body in ["first", "second", "third"] {
        client.publish(&events, body).unwrap();
    }
    settle(&client).await;

    // Assert
    assert_eq!(
        broker.messages(&events),
        vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"third")
        ]
    );
    assert_eq!(broker.declare_count(&events), 1);
}

/// Verify that messages published while the broker is away go out after reconnecting
#[tokio::test(start_paused = true)]
async fn test_event_driven_publish_survives_broker_restart() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = event_client(&broker);
    let events = queue("events");
    client.publish(&events, "before").unwrap();
    settle(&client).await;

    // Act
    broker.fail_next_connects(1);
    broker.drop_connections();
    client.publish(&events, "during").unwrap();

    // Assert
    eventually(|| broker.queue_depth(&events) == 2).await;
    assert_eq!(broker.connect_attempts(), 3);
}
