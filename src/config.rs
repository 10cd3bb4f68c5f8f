//! # Configuration Management
//!
//! Protocol constants and structured configuration for listeners and connectors.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - Encryption is opt-in on the acceptor; the acceptor alone decides whether it is used
//! - The handshake timeouts bound how long a silent peer can hold a socket

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Magic bytes opening every handshake ("REDSOCKET")
pub const MAGIC_BYTES: [u8; 9] = [0x52, 0x45, 0x44, 0x53, 0x4F, 0x43, 0x4B, 0x45, 0x54];

/// Positive acknowledgement
pub const ACK: u8 = 0x06;

/// Negative acknowledgement
pub const NAK: u8 = 0x15;

/// End of the plain handshake; TLS starts next if negotiated
pub const EOT: u8 = 0x04;

/// Field index reserved as the end-of-record sentinel
pub const END_OF_RECORD: u16 = 0xFFFF;

/// Kind byte for a single scalar or nested record field
pub const KIND_SINGLE: u8 = 0x0;

/// Kind byte for an array field
pub const KIND_ARRAY: u8 = 0x1;

/// Protocol version as exchanged in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Versions are compatible when major and minor agree; patch is ignored
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version compiled into this build
pub const PROTOCOL_VERSION: Version = Version::new(1, 0, 0);

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 128;

/// Max bytes one record may occupy while it is being received (16 MB)
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

fn default_max_record_size() -> usize {
    MAX_RECORD_SIZE
}

fn validate_max_record_size(size: usize, errors: &mut Vec<String>) {
    if size == 0 {
        errors.push("Max record size cannot be 0".to_string());
    } else if size < 1024 {
        errors.push("Max record size too small (minimum: 1 KB)".to_string());
    } else if size > 100 * 1024 * 1024 {
        errors.push(format!(
            "Max record size too large: {size} bytes (maximum recommended: 100 MB)"
        ));
    }
}

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Connector configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Certificate material and TLS options
    #[serde(default)]
    pub tls: TlsSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("REDSOCKET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("REDSOCKET_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(backlog) = std::env::var("REDSOCKET_BACKLOG") {
            config.server.backlog = backlog.parse::<u32>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid REDSOCKET_BACKLOG: {e}"))
            })?;
        }

        if let Ok(timeout) = std::env::var("REDSOCKET_CONNECTION_TIMEOUT_MS") {
            let millis = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid REDSOCKET_CONNECTION_TIMEOUT_MS: {e}"))
            })?;
            config.client.connection_timeout = Duration::from_millis(millis);
        }

        if let Ok(timeout) = std::env::var("REDSOCKET_HANDSHAKE_TIMEOUT_MS") {
            let millis = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid REDSOCKET_HANDSHAKE_TIMEOUT_MS: {e}"))
            })?;
            config.server.handshake_timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.tls.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener (acceptor side) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:3005")
    pub address: String,

    /// Pending connection queue length passed to listen(2)
    pub backlog: u32,

    /// Whether to tell initiators to disable small-write batching
    pub no_delay: bool,

    /// Upper bound on a single acceptor handshake, TLS upgrade included
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Largest record accepted connections will buffer before giving up
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:3005"),
            backlog: DEFAULT_BACKLOG,
            no_delay: true,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            max_record_size: MAX_RECORD_SIZE,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:3005')",
                self.address
            ));
        }

        if self.backlog == 0 {
            errors.push("Backlog must be greater than 0".to_string());
        } else if self.backlog > 65_535 {
            errors.push(format!("Backlog too large: {} (maximum: 65535)", self.backlog));
        }

        if self.handshake_timeout.as_millis() < 10 {
            errors.push("Handshake timeout too short (minimum: 10ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        validate_max_record_size(self.max_record_size, &mut errors);

        errors
    }
}

/// Connector (initiator side) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target address
    pub address: String,

    /// Name presented for TLS server verification; defaults to the target IP
    #[serde(default)]
    pub server_name: Option<String>,

    /// Single deadline covering TCP connect, handshake and TLS upgrade
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Largest record the connection will buffer before giving up
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:3005"),
            server_name: None,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            max_record_size: MAX_RECORD_SIZE,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:3005')",
                self.address
            ));
        }

        if let Some(name) = &self.server_name {
            if name.is_empty() {
                errors.push("Server name cannot be empty when set".to_string());
            }
        }

        if self.connection_timeout.as_millis() < 10 {
            errors.push("Connection timeout too short (minimum: 10ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        validate_max_record_size(self.max_record_size, &mut errors);

        errors
    }
}

/// Certificate material for the optional TLS upgrade
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TlsSettings {
    /// Whether the acceptor negotiates encryption
    pub enabled: bool,

    /// PEM certificate chain presented by this side
    #[serde(default)]
    pub cert_path: Option<String>,

    /// PEM PKCS8 private key matching `cert_path`
    #[serde(default)]
    pub key_path: Option<String>,

    /// CA bundle used to verify peer certificates: client certificates on the
    /// acceptor, the server chain on the initiator
    #[serde(default)]
    pub client_ca_path: Option<String>,

    /// Check peer certificates against the revocation lists below: client
    /// certificates on the acceptor, the server chain on the initiator
    #[serde(default)]
    pub check_certificate_revocation: bool,

    /// PEM certificate revocation lists
    #[serde(default)]
    pub crl_paths: Vec<String>,

    /// Skip server certificate verification on the initiator (development only)
    #[serde(default)]
    pub insecure: bool,

    /// Hex-encoded SHA-256 fingerprint of the expected server certificate
    #[serde(default)]
    pub pinned_cert_sha256: Option<String>,
}

impl TlsSettings {
    /// Validate TLS settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("cert_path and key_path must be set together".to_string());
        }

        if self.enabled && self.cert_path.is_none() {
            errors.push("TLS enabled but no cert_path/key_path configured".to_string());
        }

        if self.check_certificate_revocation {
            if self.client_ca_path.is_none() {
                errors.push("Revocation checking requires client_ca_path".to_string());
            }
            if self.crl_paths.is_empty() {
                errors.push("Revocation checking requires at least one CRL path".to_string());
            }
        }

        if let Some(pin) = &self.pinned_cert_sha256 {
            if decode_hex(pin).map(|b| b.len() != 32).unwrap_or(true) {
                errors.push(format!(
                    "Invalid pinned certificate fingerprint: '{pin}' (expected 64 hex characters)"
                ));
            }
        }

        errors
    }

    /// Decoded pinned fingerprint, if any
    pub fn pinned_fingerprint(&self) -> Result<Option<Vec<u8>>> {
        self.pinned_cert_sha256
            .as_deref()
            .map(|pin| {
                decode_hex(pin).ok_or_else(|| {
                    ProtocolError::ConfigError(format!("Invalid pinned fingerprint: {pin}"))
                })
            })
            .transpose()
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("redsocket"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
