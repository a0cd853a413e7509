//! Tests for [`QueueSettings`] loading and validation.

use super::*;
use serial_test::serial;
use std::io::Write;

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with(ENV_PREFIX) {
            std::env::remove_var(key);
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

mod defaults {
    use super::*;

    #[test]
    fn test_defaults_use_broker_with_blocking_client() {
        let settings = QueueSettings::default();

        assert!(settings.using_broker);
        assert!(!settings.event_loop_mode);
        assert_eq!(settings.connection.host, "localhost");
        assert_eq!(settings.connection.port, 5672);
        assert_eq!(settings.retry.max_retries, 3);
        assert!(settings.consumer.requeue_on_failure);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_default_reconnect_policy_is_fixed_two_seconds() {
        let policy = ReconnectSettings::default().policy();
        assert_eq!(policy, ReconnectPolicy::fixed(Duration::from_secs(2)));
    }

    #[test]
    fn test_blocking_params_disable_heartbeats() {
        let params = ConnectionParams {
            heartbeat_secs: Some(60),
            ..ConnectionParams::default()
        };

        let blocking = params.for_blocking();
        assert!(blocking.heartbeats_disabled());
        assert_eq!(blocking.host, params.host);
        assert!(!params.heartbeats_disabled());
    }

    #[test]
    fn test_connection_debug_redacts_password() {
        let params = ConnectionParams {
            password: "hunter2".to_string(),
            ..ConnectionParams::default()
        };

        let debug_str = format!("{:?}", params);
        assert!(
            !debug_str.contains("hunter2"),
            "debug output must not leak the password: {debug_str}"
        );
        assert!(debug_str.contains("REDACTED"));
    }
}

// ============================================================================
// Validation
// ============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_empty_host_is_missing() {
        let mut settings = QueueSettings::default();
        settings.connection.host = "  ".to_string();

        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Missing { .. })
        ));
    }

    #[test]
    fn test_zero_port_is_invalid() {
        let mut settings = QueueSettings::default();
        settings.connection.port = 0;

        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_backoff_requires_sane_bounds() {
        let mut settings = QueueSettings::default();
        settings.reconnect.strategy = ReconnectStrategy::ExponentialBackoff;
        settings.reconnect.delay_ms = 5_000;
        settings.reconnect.max_delay_ms = 1_000;
        assert!(settings.validate().is_err());

        settings.reconnect.max_delay_ms = 10_000;
        settings.reconnect.multiplier = 0.5;
        assert!(settings.validate().is_err());

        settings.reconnect.multiplier = 2.0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_jitter_out_of_range_is_invalid() {
        let mut settings = QueueSettings::default();
        settings.reconnect.jitter_percent = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_is_invalid() {
        let mut settings = QueueSettings::default();
        settings.consumer.poll_interval_ms = 0;
        assert!(settings.validate().is_err());
    }
}

// ============================================================================
// Loading
// ============================================================================

mod loading {
    use super::*;

    #[test]
    #[serial]
    fn test_load_without_file_uses_defaults() {
        clear_env();

        let settings = QueueSettings::load(None).unwrap();
        assert_eq!(settings.connection.host, "localhost");
        assert!(settings.using_broker);
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        clear_env();

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "event_loop_mode: true\n\
             connection:\n  host: rabbitmq.internal\n  port: 5673\n  heartbeat_secs: 30\n\
             retry:\n  max_retries: 5\n\
             reconnect:\n  strategy: exponential_backoff\n  delay_ms: 500"
        )
        .unwrap();

        let settings = QueueSettings::load(Some(file.path())).unwrap();
        assert!(settings.event_loop_mode);
        assert_eq!(settings.connection.host, "rabbitmq.internal");
        assert_eq!(settings.connection.port, 5673);
        assert_eq!(settings.connection.heartbeat_secs, Some(30));
        assert_eq!(settings.connection.username, "guest");
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.reconnect.strategy, ReconnectStrategy::ExponentialBackoff);
        assert_eq!(settings.reconnect.delay_ms, 500);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        clear_env();

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "connection:\n  host: from-file").unwrap();

        std::env::set_var("QUEUE_RELAY__CONNECTION__HOST", "from-env");
        std::env::set_var("QUEUE_RELAY__USING_BROKER", "false");

        let result = QueueSettings::load(Some(file.path()));
        clear_env();

        let settings = result.unwrap();
        assert_eq!(settings.connection.host, "from-env");
        assert!(!settings.using_broker);
    }

    #[test]
    #[serial]
    fn test_missing_file_is_an_error() {
        clear_env();

        let result = QueueSettings::load(Some(Path::new("/nonexistent/queue-relay.yaml")));
        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }

    #[test]
    #[serial]
    fn test_invalid_values_fail_validation_on_load() {
        clear_env();

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "connection:\n  port: 0").unwrap();

        let result = QueueSettings::load(Some(file.path()));
        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
    }
}
