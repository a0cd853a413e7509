//! Tests for the queue service facade.

use super::*;
use crate::providers::memory::InMemoryBroker;
use crate::transport::ConnectionState;
use anyhow::anyhow;
use serde_json::json;
use std::sync::Mutex;

fn queue(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

fn direct_settings() -> QueueSettings {
    QueueSettings {
        using_broker: false,
        ..QueueSettings::default()
    }
}

fn blocking_service(broker: &InMemoryBroker) -> QueueService {
    QueueService::builder(QueueSettings::default())
        .with_blocking_broker(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

/// Records every event handed to it
#[derive(Default)]
struct RecordingWorkers {
    seen: Mutex<Vec<(QueueName, Value)>>,
    fail: bool,
}

impl WorkerLookup for RecordingWorkers {
    fn consume_direct(&self, queue: &QueueName, event: &Value) -> anyhow::Result<()> {
        if self.fail {
            return Err(anyhow!("worker rejected event"));
        }
        self.seen.lock().unwrap().push((queue.clone(), event.clone()));
        Ok(())
    }
}

// ============================================================================
// Building
// ============================================================================

mod building {
    use super::*;

    #[test]
    fn test_direct_mode_needs_no_broker() {
        let service = QueueService::builder(direct_settings()).build().unwrap();

        assert_eq!(service.mode(), ServiceMode::Direct);
        assert!(service.event_client().is_none());
        assert_eq!(service.max_retries(), 3);
    }

    #[test]
    fn test_blocking_mode_without_broker_is_rejected() {
        let result = QueueService::builder(QueueSettings::default()).build();

        assert!(matches!(
            result,
            Err(QueueError::ConfigurationError(ConfigurationError::Missing { .. }))
        ));
    }

    #[test]
    fn test_blocking_mode_reports_connect_failure() {
        let broker = InMemoryBroker::with_credentials("relay", "secret");

        let result = QueueService::builder(QueueSettings::default())
            .with_blocking_broker(Arc::new(broker))
            .build();

        assert!(matches!(result, Err(QueueError::AuthenticationFailed { .. })));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut settings = direct_settings();
        settings.connection.port = 0;

        let result = QueueService::builder(settings).build();
        assert!(matches!(result, Err(QueueError::ConfigurationError(_))));
    }

    #[test]
    fn test_event_loop_mode_requires_runtime() {
        let settings = QueueSettings {
            event_loop_mode: true,
            ..QueueSettings::default()
        };

        let result = QueueService::builder(settings)
            .with_async_broker(Arc::new(InMemoryBroker::new()))
            .build();

        assert!(matches!(
            result,
            Err(QueueError::ConfigurationError(ConfigurationError::Invalid { .. }))
        ));
    }
}

// ============================================================================
// Publishing
// ============================================================================

mod publishing {
    use super::*;

    #[test]
    fn test_fallback_takes_precedence_over_worker_lookup() {
        let workers = Arc::new(RecordingWorkers::default());
        let service = QueueService::builder(direct_settings())
            .with_worker_lookup(workers.clone())
            .build()
            .unwrap();
        let handled = Mutex::new(Vec::new());
        let fallback = |event: &Value| -> anyhow::Result<()> {
            handled.lock().unwrap().push(event.clone());
            Ok(())
        };

        service
            .queue_publish(&queue("events"), &json!({"id": 1}), Some(&fallback))
            .unwrap();

        assert_eq!(*handled.lock().unwrap(), vec![json!({"id": 1})]);
        assert!(workers.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_direct_mode_uses_worker_lookup() {
        let workers = Arc::new(RecordingWorkers::default());
        let service = QueueService::builder(direct_settings())
            .with_worker_lookup(workers.clone())
            .build()
            .unwrap();

        service
            .queue_publish(&queue("events"), &json!({"id": 2}), None)
            .unwrap();

        assert_eq!(
            *workers.seen.lock().unwrap(),
            vec![(queue("events"), json!({"id": 2}))]
        );
    }

    #[test]
    fn test_direct_failure_is_reported() {
        let workers = Arc::new(RecordingWorkers {
            fail: true,
            ..RecordingWorkers::default()
        });
        let service = QueueService::builder(direct_settings())
            .with_worker_lookup(workers)
            .build()
            .unwrap();

        let result = service.queue_publish(&queue("events"), &json!({}), None);
        match result {
            Err(QueueError::DirectDispatch { queue, source }) => {
                assert_eq!(queue, "events");
                assert_eq!(source.to_string(), "worker rejected event");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_direct_mode_without_any_target_fails() {
        let service = QueueService::builder(direct_settings()).build().unwrap();

        let result = service.queue_publish(&queue("events"), &json!({}), None);
        assert!(matches!(
            result,
            Err(QueueError::ConfigurationError(ConfigurationError::Missing { .. }))
        ));
    }

    #[test]
    fn test_blocking_mode_publishes_json() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);

        service
            .queue_publish(&queue("signups"), &json!({"user_id": 7}), None)
            .unwrap();

        assert_eq!(service.mode(), ServiceMode::Blocking);
        assert_eq!(
            broker.messages(&queue("signups")),
            vec![Bytes::from_static(br#"{"user_id":7}"#)]
        );
    }

    #[test]
    fn test_blocking_mode_retries_once_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);
        service
            .queue_publish(&queue("signups"), &json!({"n": 1}), None)
            .unwrap();

        broker.fail_next_publishes(1);
        service
            .queue_publish(&queue("signups"), &json!({"n": 2}), None)
            .unwrap();

        assert_eq!(broker.queue_depth(&queue("signups")), 2);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[test]
    fn test_blocking_mode_is_usable_from_many_threads() {
        let broker = InMemoryBroker::new();
        let service = Arc::new(blocking_service(&broker));

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        service
                            .queue_publish(&queue("events"), &json!({"t": n, "i": i}), None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(broker.queue_depth(&queue("events")), 20);
        assert_eq!(broker.declare_count(&queue("events")), 1);
    }

    #[test]
    fn test_drain_through_service() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);
        for n in 0..3 {
            service
                .queue_publish(&queue("digests"), &json!({"n": n}), None)
                .unwrap();
        }

        let drained = service.drain_queue(&queue("digests")).unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], Bytes::from_static(br#"{"n":0}"#));
        assert!(service.drain_queue(&queue("digests")).unwrap().is_empty());
    }

    #[test]
    fn test_drain_is_rejected_in_direct_mode() {
        let service = QueueService::builder(direct_settings()).build().unwrap();

        assert!(service.drain_queue(&queue("digests")).is_err());
    }

    #[test]
    fn test_publish_after_shutdown_fails() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);

        service.shutdown().unwrap();

        assert_eq!(broker.open_connections(), 0);
        assert!(matches!(
            service.queue_publish(&queue("events"), &json!({}), None),
            Err(QueueError::ClientShutdown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_driven_mode_publishes_in_background() {
        let broker = InMemoryBroker::new();
        let settings = QueueSettings {
            event_loop_mode: true,
            ..QueueSettings::default()
        };
        let service = QueueService::builder(settings)
            .with_async_broker(Arc::new(broker.clone()))
            .build()
            .unwrap();

        service
            .queue_publish(&queue("events"), &json!({"id": 9}), None)
            .unwrap();

        let client = service.event_client().unwrap();
        client.wait_for_state(ConnectionState::Open).await.unwrap();
        client.declared_queues().await.unwrap();
        assert_eq!(broker.queue_depth(&queue("events")), 1);
    }
}

// ============================================================================
// Retrying
// ============================================================================

mod retrying {
    use super::*;

    #[test]
    fn test_event_is_republished_three_times_then_exhausted() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);
        let retries = queue("retries");
        let exhausted = Mutex::new(Vec::new());
        let on_failure = |event: &RetryEnvelope| exhausted.lock().unwrap().push(event.clone());
        let mut event = RetryEnvelope::default();

        let outcomes: Vec<_> = (0..4)
            .map(|_| service.retry_event(&retries, &mut event, Some(&on_failure)))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                RetryOutcome::Republished,
                RetryOutcome::Republished,
                RetryOutcome::Republished,
                RetryOutcome::Exhausted
            ]
        );
        assert_eq!(event.failed_tries, 4);
        assert_eq!(broker.queue_depth(&retries), 3);
        assert_eq!(broker.messages(&retries)[2], Bytes::from_static(br#"{"failed_tries":3}"#));

        let exhausted = exhausted.lock().unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].failed_tries, 4);
    }

    #[test]
    fn test_payload_fields_travel_with_the_count() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);
        let mut event = RetryEnvelope::from_value(json!({"job": "resize", "failed_tries": 1})).unwrap();

        let outcome = service.retry_event_with_limit(&queue("jobs"), &mut event, 5, None);

        assert_eq!(outcome, RetryOutcome::Republished);
        let published: Value = serde_json::from_slice(&broker.messages(&queue("jobs"))[0]).unwrap();
        assert_eq!(published, json!({"job": "resize", "failed_tries": 2}));
    }

    #[test]
    fn test_republish_failure_is_swallowed() {
        let broker = InMemoryBroker::new();
        let service = blocking_service(&broker);
        service.shutdown().unwrap();
        let mut event = RetryEnvelope::default();

        let outcome = service.retry_event(&queue("retries"), &mut event, None);

        assert_eq!(outcome, RetryOutcome::RepublishFailed);
        assert_eq!(event.failed_tries, 1);
    }

    #[test]
    fn test_zero_limit_exhausts_immediately() {
        let workers = Arc::new(RecordingWorkers::default());
        let service = QueueService::builder(direct_settings())
            .with_worker_lookup(workers.clone())
            .build()
            .unwrap();
        let mut event = RetryEnvelope::default();

        let outcome = service.retry_event_with_limit(&queue("retries"), &mut event, 0, None);

        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert!(workers.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_direct_mode_retry_does_not_run_worker() {
        let workers = Arc::new(RecordingWorkers::default());
        let service = QueueService::builder(direct_settings())
            .with_worker_lookup(workers.clone())
            .build()
            .unwrap();
        let mut event = RetryEnvelope::from_value(json!({"job": "resize"})).unwrap();

        let outcome = service.retry_event(&queue("retries"), &mut event, None);

        assert_eq!(outcome, RetryOutcome::Republished);
        assert_eq!(event.failed_tries, 1);
        assert!(workers.seen.lock().unwrap().is_empty());
    }
}
