//! Tests for message types and identifiers.

use super::*;

mod queue_name {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(QueueName::new("user_activity").is_ok());
        assert!(QueueName::new("missedmessage-emails").is_ok());
        assert!(QueueName::new("appointments.requested").is_ok());
        assert!(QueueName::new("a").is_ok());
        assert!(QueueName::new("a".repeat(QueueName::MAX_LEN)).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("a".repeat(QueueName::MAX_LEN + 1)).is_err());
        assert!(QueueName::new("-leading").is_err());
        assert!(QueueName::new("trailing.").is_err());
        assert!(QueueName::new("_leading").is_err());
        assert!(QueueName::new("trailing_").is_err());
        assert!(QueueName::new("has space").is_err());
        assert!(QueueName::new("special@chars").is_err());
    }

    #[test]
    fn test_from_str_and_display_agree() {
        let name: QueueName = "signups".parse().unwrap();
        assert_eq!(name.to_string(), "signups");
        assert_eq!(name.as_str(), "signups");
    }

    #[test]
    fn test_serde_validates() {
        let name: QueueName = serde_json::from_str("\"digest_emails\"").unwrap();
        assert_eq!(name.as_str(), "digest_emails");

        assert!(serde_json::from_str::<QueueName>("\"bad name\"").is_err());
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"digest_emails\"");
    }
}

mod identifiers {
    use super::*;

    #[test]
    fn test_consumer_tags_are_unique_and_prefixed() {
        let queue = QueueName::new("events").unwrap();
        let first = ConsumerTag::generate(&queue);
        let second = ConsumerTag::generate(&queue);

        assert_ne!(first, second);
        assert!(first.as_str().starts_with("events_"));
        assert_eq!(first.as_str().len(), "events_".len() + 32);
    }

    #[test]
    fn test_consumer_ids_are_unique() {
        assert_ne!(ConsumerId::new(), ConsumerId::new());
    }

    #[test]
    fn test_delivery_tag_ordering() {
        assert!(DeliveryTag::new(1) < DeliveryTag::new(2));
        assert_eq!(DeliveryTag::new(9).value(), 9);
        assert_eq!(DeliveryTag::new(9).to_string(), "9");
    }
}

mod delivery {
    use super::*;

    fn delivery_with_body(body: &'static [u8]) -> Delivery {
        Delivery {
            delivery_tag: DeliveryTag::new(1),
            consumer_tag: None,
            queue: QueueName::new("events").unwrap(),
            body: Bytes::from_static(body),
            redelivered: false,
            delivered_at: Timestamp::now(),
        }
    }

    #[test]
    fn test_json_body_decodes() {
        let delivery = delivery_with_body(br#"{"user_id": 42}"#);
        let value: serde_json::Value = delivery.json().unwrap();
        assert_eq!(value["user_id"], 42);
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let delivery = delivery_with_body(b"not json");
        let result = delivery.json::<serde_json::Value>();
        assert!(matches!(result, Err(QueueError::SerializationError(_))));
    }

    #[test]
    fn test_body_str_rejects_invalid_utf8() {
        let delivery = delivery_with_body(&[0xff, 0xfe]);
        assert!(matches!(
            delivery.body_str(),
            Err(QueueError::SerializationError(SerializationError::InvalidUtf8))
        ));

        let delivery = delivery_with_body(b"plain text");
        assert_eq!(delivery.body_str().unwrap(), "plain text");
    }
}
