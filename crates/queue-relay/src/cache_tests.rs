use super::*;

fn queue(name: &str) -> QueueName {
    QueueName::new(name).unwrap()
}

#[test]
fn test_mark_declared_is_idempotent() {
    let mut cache = QueueDeclarationCache::new();

    assert!(cache.mark_declared(queue("events")));
    assert!(!cache.mark_declared(queue("events")));
    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&queue("events")));
    assert!(!cache.contains(&queue("other")));
}

#[test]
fn test_clear_forgets_everything() {
    let mut cache = QueueDeclarationCache::new();
    cache.mark_declared(queue("a"));
    cache.mark_declared(queue("b"));

    cache.clear();

    assert!(cache.is_empty());
    assert!(!cache.contains(&queue("a")));
}

#[test]
fn test_names_are_sorted() {
    let mut cache = QueueDeclarationCache::new();
    cache.mark_declared(queue("zeta"));
    cache.mark_declared(queue("alpha"));
    cache.mark_declared(queue("mid"));

    assert_eq!(cache.names(), vec![queue("alpha"), queue("mid"), queue("zeta")]);
}
