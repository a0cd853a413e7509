//! Tests for message counters.

use super::*;

fn queue(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

#[test]
fn test_counters_are_labelled_by_queue_and_event() {
    let registry = Registry::new();
    let metrics = PrometheusMetrics::new(&registry).unwrap();

    metrics.increment(MetricEvent::Published, &queue("signups"));
    metrics.increment(MetricEvent::Published, &queue("signups"));
    metrics.increment(MetricEvent::Acked, &queue("signups"));
    metrics.increment(MetricEvent::Nacked, &queue("emails"));

    assert_eq!(metrics.count(MetricEvent::Published, &queue("signups")), 2);
    assert_eq!(metrics.count(MetricEvent::Acked, &queue("signups")), 1);
    assert_eq!(metrics.count(MetricEvent::Nacked, &queue("emails")), 1);
    assert_eq!(metrics.count(MetricEvent::Drained, &queue("emails")), 0);
}

#[test]
fn test_counters_are_exposed_through_registry() {
    let registry = Registry::new();
    let metrics = PrometheusMetrics::new(&registry).unwrap();
    metrics.increment(MetricEvent::Drained, &queue("digests"));

    use prometheus::Encoder;

    let mut buffer = Vec::new();
    prometheus::TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .unwrap();
    let text = String::from_utf8(buffer).unwrap();

    assert!(
        text.contains(r#"queue_relay_messages_total{event="drained",queue="digests"} 1"#),
        "unexpected exposition: {text}"
    );
}

#[test]
fn test_registering_twice_on_one_registry_fails() {
    let registry = Registry::new();
    PrometheusMetrics::new(&registry).unwrap();
    assert!(PrometheusMetrics::new(&registry).is_err());
}

#[test]
fn test_event_labels() {
    assert_eq!(MetricEvent::Published.as_str(), "published");
    assert_eq!(MetricEvent::Acked.as_str(), "acked");
    assert_eq!(MetricEvent::Nacked.as_str(), "nacked");
    assert_eq!(MetricEvent::Drained.as_str(), "drained");
}
