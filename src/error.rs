//! # Error Types
//!
//! Error handling for the connection handshake and the record codec.
//!
//! This module defines all error variants that can occur while establishing a
//! connection, upgrading it to TLS, or moving records across it.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Handshake Errors**: protocol violations, timeouts, refused peers
//! - **Encryption Errors**: TLS authentication and confirmation failures
//! - **Codec Errors**: unregistered types, unknown class ids, unknown fields, truncated records
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use redsocket::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn class_id(raw: &[u8]) -> Result<u32> {
//!     let bytes: [u8; 4] = raw.get(..4).and_then(|b| b.try_into().ok()).ok_or(ProtocolError::Truncated)?;
//!     Ok(u32::from_le_bytes(bytes))
//! }
//!
//! match class_id(&[1, 0]) {
//!     Ok(id) => info!(id, "Read class id"),
//!     Err(e) => error!(error=%e, "Failed to read class id"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Handshake errors
    pub const ERR_BAD_MAGIC: &str = "Magic header mismatch";
    pub const ERR_SHORT_READ: &str = "Peer closed the stream mid-handshake";
    pub const ERR_EXPECTED_ACK: &str = "Expected ACK from peer";
    pub const ERR_EXPECTED_EOT: &str = "Expected end-of-handshake marker from peer";
    pub const ERR_PEER_REFUSED: &str = "Peer refused the connection";
    pub const ERR_VERSION_MISMATCH: &str = "Peer protocol version is incompatible";

    /// Encryption errors
    pub const ERR_NO_SERVER_TLS: &str = "Encryption enabled without a server certificate";
    pub const ERR_CONFIRMATION_FAILED: &str = "Peer did not confirm the encrypted channel";

    /// Connection state errors
    pub const ERR_ALREADY_ACTIVE: &str = "Connection is already active";
    pub const ERR_NOT_CONNECTED: &str = "Connection is not established";
}

/// ProtocolError is the primary error type for all crate operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    #[error("Type '{0}' is not registered")]
    UnregisteredType(&'static str),

    #[error("Type '{0}' is already registered")]
    AlreadyRegistered(&'static str),

    #[error("Class id {0} is not registered")]
    UnknownClassId(u32),

    #[error("Failed to convert '{found}' to '{expected}'")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Field index {index} is not declared on '{type_name}'")]
    UnknownField { type_name: &'static str, index: u16 },

    #[error("Field index {index} carries invalid kind byte {kind:#04x}")]
    InvalidFieldKind { index: u16, kind: u8 },

    #[error("Invalid field table for '{type_name}': {reason}")]
    InvalidFieldTable {
        type_name: &'static str,
        reason: String,
    },

    #[error("Record truncated before end-of-record sentinel")]
    Truncated,

    #[error("Negative length or count on the wire: {0}")]
    InvalidLength(i32),

    #[error("Length {0} does not fit the wire format")]
    LengthOverflow(usize),

    #[error("Record exceeds the {limit} byte limit ({buffered} bytes buffered)")]
    RecordTooLarge { buffered: usize, limit: usize },

    #[error("Operation cancelled before a record started")]
    Cancelled,

    #[error("String payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Whether this error came from the handshake or TLS upgrade rather than the codec
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::ProtocolViolation(_)
                | ProtocolError::HandshakeTimeout
                | ProtocolError::EncryptionFailure(_)
                | ProtocolError::TlsError(_)
        )
    }
}
