//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use redsocket::config::{
    ClientConfig, LoggingConfig, NetworkConfig, ServerConfig, TlsSettings, MAX_RECORD_SIZE,
};
use std::time::Duration;
use tracing::Level;

const PIN: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_backlog() {
    let mut config = NetworkConfig::default();
    config.server.backlog = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Backlog must be greater than 0")));
}

#[test]
fn test_excessive_backlog() {
    let mut config = NetworkConfig::default();
    config.server.backlog = 100_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Backlog too large")));
}

#[test]
fn test_handshake_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = Duration::from_millis(5);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));

    config.server.handshake_timeout = Duration::from_secs(400);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too long")));
}

#[test]
fn test_connection_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_millis(5);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connection timeout too short")));

    config.client.connection_timeout = Duration::from_secs(400);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connection timeout too long")));
}

#[test]
fn test_max_record_size_bounds() {
    let mut config = NetworkConfig::default();
    assert_eq!(config.server.max_record_size, MAX_RECORD_SIZE);
    assert_eq!(config.client.max_record_size, MAX_RECORD_SIZE);

    config.server.max_record_size = 0;
    config.client.max_record_size = 512;
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max record size cannot be 0")));
    assert!(errors.iter().any(|e| e.contains("Max record size too small")));

    config.server.max_record_size = 200 * 1024 * 1024;
    config.client.max_record_size = 1024;
    let errors = config.validate();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("Max record size too large"));
}

#[test]
fn test_invalid_client_address() {
    let mut config = NetworkConfig::default();
    config.client.address = "not:a:valid:address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid client address")));
}

#[test]
fn test_empty_server_name() {
    let mut config = NetworkConfig::default();
    config.client.server_name = Some(String::new());

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Server name cannot be empty")));
}

#[test]
fn test_tls_enabled_without_certificate() {
    let mut config = NetworkConfig::default();
    config.tls.enabled = true;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("TLS enabled but no cert_path")));
}

#[test]
fn test_tls_cert_without_key() {
    let mut config = NetworkConfig::default();
    config.tls.cert_path = Some("server.pem".to_string());

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("cert_path and key_path must be set together")));
}

#[test]
fn test_revocation_requires_ca_and_crls() {
    let mut config = NetworkConfig::default();
    config.tls.check_certificate_revocation = true;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Revocation checking requires client_ca_path")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Revocation checking requires at least one CRL path")));
}

#[test]
fn test_pinned_fingerprint() {
    let mut config = NetworkConfig::default();
    config.tls.pinned_cert_sha256 = Some(PIN.to_string());
    assert!(config.validate().is_empty());
    assert_eq!(config.tls.pinned_fingerprint().unwrap().unwrap().len(), 32);

    config.tls.pinned_cert_sha256 = Some("abcd".to_string());
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid pinned certificate fingerprint")));

    config.tls.pinned_cert_sha256 = Some("zz".to_string());
    assert!(config.tls.pinned_fingerprint().is_err());
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = NetworkConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let error = config.validate_strict().unwrap_err();
    assert!(error.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    config.server.address = String::new();
    config.server.backlog = 0;
    config.client.address = String::new();
    config.tls.enabled = true;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_valid_production_config() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("server.log");

    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:8443".to_string(),
            backlog: 1024,
            no_delay: true,
            handshake_timeout: Duration::from_secs(10),
            max_record_size: 4 * 1024 * 1024,
        },
        client: ClientConfig {
            address: "10.0.0.5:8443".to_string(),
            server_name: Some("orders.internal".to_string()),
            connection_timeout: Duration::from_secs(3),
            max_record_size: MAX_RECORD_SIZE,
        },
        tls: TlsSettings {
            enabled: true,
            cert_path: Some("/etc/redsocket/server.pem".to_string()),
            key_path: Some("/etc/redsocket/server.key".to_string()),
            client_ca_path: Some("/etc/redsocket/ca.pem".to_string()),
            check_certificate_revocation: true,
            crl_paths: vec!["/etc/redsocket/ca.crl".to_string()],
            insecure: false,
            pinned_cert_sha256: None,
        },
        logging: LoggingConfig {
            app_name: "order-gateway".to_string(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: true,
            log_file_path: Some(log_path.to_string_lossy().into_owned()),
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid, got: {:?}", errors);
}

#[test]
fn test_from_toml_with_partial_sections() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "0.0.0.0:4000"
        backlog = 16
        no_delay = false
        handshake_timeout = 2500

        [tls]
        enabled = false
        insecure = true
        "#,
    )
    .unwrap();

    assert_eq!(config.server.address, "0.0.0.0:4000");
    assert_eq!(config.server.backlog, 16);
    assert!(!config.server.no_delay);
    assert_eq!(config.server.handshake_timeout, Duration::from_millis(2500));
    assert_eq!(config.server.max_record_size, MAX_RECORD_SIZE);
    assert!(config.tls.insecure);
    // Missing sections fall back to defaults
    assert_eq!(config.client.address, ClientConfig::default().address);
    assert_eq!(config.logging.log_level, Level::INFO);
}

#[test]
fn test_from_toml_rejects_garbage() {
    let error = NetworkConfig::from_toml("[server\naddress = ").unwrap_err();
    assert!(error.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_example_config_parses_back() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert_eq!(parsed.server.address, NetworkConfig::default().server.address);
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("redsocket.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.backlog = 42;
        c.client.server_name = Some("localhost".to_string());
        c.logging.log_level = Level::DEBUG;
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.server.backlog, 42);
    assert_eq!(loaded.client.server_name.as_deref(), Some("localhost"));
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_from_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let error = NetworkConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(error.to_string().contains("Failed to open config file"));
}

// All environment cases live in one test so parallel tests never race on the
// process environment
#[test]
fn test_from_env_overrides() {
    std::env::set_var("REDSOCKET_SERVER_ADDRESS", "0.0.0.0:9100");
    std::env::set_var("REDSOCKET_BACKLOG", "12");
    std::env::set_var("REDSOCKET_CONNECTION_TIMEOUT_MS", "750");
    std::env::set_var("REDSOCKET_HANDSHAKE_TIMEOUT_MS", "1500");

    let config = NetworkConfig::from_env().unwrap();
    assert_eq!(config.server.address, "0.0.0.0:9100");
    assert_eq!(config.server.backlog, 12);
    assert_eq!(config.client.connection_timeout, Duration::from_millis(750));
    assert_eq!(config.server.handshake_timeout, Duration::from_millis(1500));

    std::env::set_var("REDSOCKET_BACKLOG", "lots");
    let error = NetworkConfig::from_env().unwrap_err();
    assert!(error.to_string().contains("Invalid REDSOCKET_BACKLOG"));

    for var in [
        "REDSOCKET_SERVER_ADDRESS",
        "REDSOCKET_BACKLOG",
        "REDSOCKET_CONNECTION_TIMEOUT_MS",
        "REDSOCKET_HANDSHAKE_TIMEOUT_MS",
    ] {
        std::env::remove_var(var);
    }
}
