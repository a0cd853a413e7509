//! Integration tests for consumer acknowledgement and replay.

mod common;

use anyhow::anyhow;
use bytes::Bytes;
use common::{blocking_client, event_client, eventually, queue, settle};
use queue_relay::{InMemoryBroker, QueueError};
use std::sync::{Arc, Mutex};

/// Verify that a failing consumer rejects exactly its own delivery and the error reaches the caller
#[test]
fn test_blocking_failure_nacks_the_failing_delivery() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut client = blocking_client(&broker);
    let events = queue("events");
    client
        .register_consumer(&events, |delivery| {
            if delivery.body.as_ref() == b"bad" {
                Err(anyhow!("cannot handle bad input"))
            } else {
                Ok(())
            }
        })
        .unwrap();
    client.publish(&events, "good").unwrap();
    client.publish(&events, "bad").unwrap();

    // Act
    let result = client.consume_pending();

    // Assert
    let acked = broker.acked();
    let failed_tag = match result {
        Err(QueueError::Handler {
            delivery_tag,
            source,
            ..
        }) => {
            assert_eq!(source.to_string(), "cannot handle bad input");
            delivery_tag
        }
        other => panic!("expected handler error, got {:?}", other),
    };
    assert_eq!(acked.len(), 1);
    assert!(!acked.contains(&failed_tag));
    assert_eq!(broker.nacked()[0], (failed_tag, true));
}

/// Verify that consumers keep receiving messages after the broker drops the connection
#[test]
fn test_blocking_consumers_are_replayed_on_reconnect() {
    // Arrange
    let broker = InMemoryBroker::new();
    let mut client = blocking_client(&broker);
    let events = queue("events");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = client
        .register_consumer(&events, move |delivery| {
            sink.lock().unwrap().push(delivery.body.clone());
            Ok(())
        })
        .unwrap();
    let old_tag = client.current_consumer_tag(id).cloned().unwrap();

    // Act
    broker.drop_connections();
    client.publish(&events, "after restart").unwrap();
    client.consume_pending().unwrap();

    // Assert
    let new_tag = client.current_consumer_tag(id).cloned().unwrap();
    assert_ne!(old_tag, new_tag);
    assert_eq!(broker.subscriptions(&events), vec![new_tag]);
    assert_eq!(*seen.lock().unwrap(), vec![Bytes::from_static(b"after restart")]);
}

/// Verify that the event-driven client replays JSON consumers and acknowledges their messages
#[tokio::test(start_paused = true)]
async fn test_event_driven_json_consumer_survives_reconnect() {
    // Arrange
    let broker = InMemoryBroker::new();
    let client = event_client(&broker);
    let orders = queue("orders");
    let totals = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&totals);
    client
        .register_json_consumer(&orders, move |order: serde_json::Value| {
            sink.lock().unwrap().push(order["total"].as_u64().unwrap_or_default());
            Ok(())
        })
        .unwrap();
    settle(&client).await;

    // Act
    client.reconnect().unwrap();
    eventually(|| broker.connect_attempts() == 2).await;
    settle(&client).await;
    client
        .json_publish(&orders, &serde_json::json!({ "total": 42 }))
        .unwrap();

    // Assert
    eventually(|| broker.acked().len() == 1).await;
    assert_eq!(*totals.lock().unwrap(), vec![42]);
    assert_eq!(client.active_consumer_tags().await.unwrap().len(), 1);
    assert_eq!(broker.subscriptions(&orders).len(), 1);
}
