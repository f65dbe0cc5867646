//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serial_test::serial;
use session_wire::config::{
    ConnectConfig, LoggingConfig, NetworkConfig, SessionConfig, TransportConfig,
};
use session_wire::error::{ErrorKind, ProtocolError};
use std::time::Duration;
use tracing::Level;

fn errors_with(mutator: impl FnOnce(&mut NetworkConfig)) -> Vec<String> {
    NetworkConfig::default_with_overrides(mutator).validate()
}

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_default_values() {
    let session = SessionConfig::default();
    assert_eq!(session.max_players, 16);
    assert_eq!(session.receive_batch_size, 32);

    let transport = TransportConfig::default();
    assert!(transport.compression_enabled);
    assert_eq!(transport.compression_threshold_bytes, 128);
    assert_eq!(transport.max_message_size, 4 * 1024 * 1024);

    let connect = ConnectConfig::default();
    assert_eq!(connect.max_attempts, 30);
    assert_eq!(connect.active_timeout, Duration::from_secs(3));
}

#[test]
fn test_zero_listen_port() {
    let errors = errors_with(|c| c.session.listen_port = 0);
    assert!(errors.iter().any(|e| e.contains("Listen port cannot be 0")));
}

#[test]
fn test_zero_max_players() {
    let errors = errors_with(|c| c.session.max_players = 0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Max players must be greater than 0")));
}

#[test]
fn test_short_heartbeat_interval() {
    let errors = errors_with(|c| c.session.heartbeat_interval = Duration::from_millis(1));
    assert!(errors
        .iter()
        .any(|e| e.contains("Heartbeat interval too short")));
}

#[test]
fn test_zero_receive_batch() {
    let errors = errors_with(|c| c.session.receive_batch_size = 0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Receive batch size must be greater than 0")));
}

#[test]
fn test_zero_max_message_size() {
    let errors = errors_with(|c| c.transport.max_message_size = 0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Max message size cannot be 0")));
}

#[test]
fn test_compression_threshold_larger_than_max_message() {
    let errors = errors_with(|c| {
        c.transport.max_message_size = 1000;
        c.transport.compression_threshold_bytes = 2000;
    });
    assert!(errors
        .iter()
        .any(|e| e.contains("Compression threshold cannot be larger")));

    // Irrelevant while compression is off
    let errors = errors_with(|c| {
        c.transport.compression_enabled = false;
        c.transport.max_message_size = 1000;
        c.transport.compression_threshold_bytes = 2000;
    });
    assert!(errors.is_empty());
}

#[test]
fn test_packet_loss_out_of_range() {
    let errors = errors_with(|c| c.transport.fake_packet_loss_percent = 150.0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Packet loss must be between 0 and 100")));
}

#[test]
fn test_short_idle_timeout() {
    let errors = errors_with(|c| c.transport.idle_timeout = Duration::from_millis(10));
    assert!(errors.iter().any(|e| e.contains("Idle timeout too short")));

    // Zero disables the check
    let errors = errors_with(|c| c.transport.idle_timeout = Duration::ZERO);
    assert!(errors.is_empty());
}

#[test]
fn test_zero_connect_attempts() {
    let errors = errors_with(|c| c.connect.max_attempts = 0);
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connect attempts must be greater than 0")));
}

#[test]
fn test_poll_interval_longer_than_active_timeout() {
    let errors = errors_with(|c| {
        c.connect.active_timeout = Duration::from_millis(200);
        c.connect.poll_interval = Duration::from_millis(500);
    });
    assert!(errors
        .iter()
        .any(|e| e.contains("Poll interval cannot exceed the active timeout")));
}

#[test]
fn test_empty_app_name() {
    let errors = errors_with(|c| c.logging.app_name = String::new());
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_multiple_errors_collected() {
    let errors = errors_with(|c| {
        c.session.max_players = 0;
        c.transport.max_message_size = 0;
        c.connect.max_attempts = 0;
    });
    assert!(errors.len() >= 3, "expected several errors, got {errors:?}");
}

#[test]
fn test_validate_strict_returns_config_error() {
    let config = NetworkConfig::default_with_overrides(|c| c.session.max_players = 0);
    let err = config.validate_strict().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("Max players"));
}

#[test]
fn test_debug_toggle_raises_level() {
    let mut logging = LoggingConfig::default();
    assert_eq!(logging.effective_level(), Level::INFO);
    logging.debug_logging = true;
    assert_eq!(logging.effective_level(), Level::DEBUG);
}

#[test]
fn test_apply_settings() {
    let mut config = NetworkConfig::default();
    config
        .apply_settings(["debug=on", "packet_loss=12.5", "latency=40", "max_players=4"])
        .expect("valid settings");

    assert!(config.logging.debug_logging);
    assert_eq!(config.transport.fake_packet_loss_percent, 12.5);
    assert_eq!(config.transport.fake_latency_ms, 40);
    assert_eq!(config.session.max_players, 4);
}

#[test]
fn test_apply_setting_rejects_bad_input() {
    let mut config = NetworkConfig::default();
    assert!(matches!(
        config.apply_setting("latency", "fast"),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(matches!(
        config.apply_setting("colour", "blue"),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(config.apply_settings(["no_equals_sign"]).is_err());
}

#[test]
fn test_example_config_parses_back() {
    let text = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&text).expect("example config should parse");
    assert_eq!(parsed.session.listen_port, NetworkConfig::default().session.listen_port);
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_toml_sections_are_optional() {
    let config = NetworkConfig::from_toml(
        r#"
        [logging]
        app_name = "arena"
        log_level = "warn"
        "#,
    )
    .expect("partial config should parse");
    assert_eq!(config.logging.app_name, "arena");
    assert_eq!(config.logging.log_level, Level::WARN);
    assert_eq!(config.session.max_players, 16);
}

#[test]
fn test_durations_and_levels_in_toml() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.session.heartbeat_interval = Duration::from_millis(250);
        c.logging.log_level = Level::DEBUG;
    });
    let text = toml::to_string(&config).unwrap();
    assert!(text.contains("heartbeat_interval = 250"));
    assert!(text.contains("log_level = \"debug\""));

    let parsed = NetworkConfig::from_toml(
        r#"
        [logging]
        app_name = "arena"
        log_level = "TRACE"
        "#,
    )
    .unwrap();
    assert_eq!(parsed.logging.log_level, Level::TRACE);

    let err = NetworkConfig::from_toml(
        r#"
        [logging]
        app_name = "arena"
        log_level = "loud"
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown log level"));
}

#[test]
fn test_invalid_toml_rejected() {
    assert!(matches!(
        NetworkConfig::from_toml("session = 5"),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_save_and_load_roundtrip() {
    let path = std::env::temp_dir().join(format!("session-wire-{}.toml", std::process::id()));
    let config = NetworkConfig::default_with_overrides(|c| c.session.max_players = 8);
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.session.max_players, 8);
    std::fs::remove_file(&path).ok();
}

#[test]
#[serial]
fn test_from_env() {
    std::env::set_var("SESSION_WIRE_MAX_PLAYERS", "6");
    std::env::set_var("SESSION_WIRE_DEBUG", "true");
    let config = NetworkConfig::from_env();
    std::env::remove_var("SESSION_WIRE_MAX_PLAYERS");
    std::env::remove_var("SESSION_WIRE_DEBUG");

    let config = config.expect("env config");
    assert_eq!(config.session.max_players, 6);
    assert!(config.logging.debug_logging);
}

#[test]
#[serial]
fn test_from_env_rejects_garbage() {
    std::env::set_var("SESSION_WIRE_LATENCY_MS", "soon");
    let result = NetworkConfig::from_env();
    std::env::remove_var("SESSION_WIRE_LATENCY_MS");
    assert!(result.is_err());
}
