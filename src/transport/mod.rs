//! # Transport Layer
//!
//! Byte streams under the handshake: plain TCP and its optional TLS upgrade.
//!
//! ## Components
//! - **TLS**: rustls configuration for both roles, client certificates, revocation lists
//! - **Stream**: `ConnectionStream`, one type for plain and encrypted connections

pub mod stream;
pub mod tls;
