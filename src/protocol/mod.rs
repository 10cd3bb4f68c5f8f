//! # Connection Protocol
//!
//! The byte-exact handshake that precedes record traffic, and the connection
//! lifecycle states it drives.
//!
//! ## Components
//! - **Handshake**: magic/version gate, option negotiation, TLS confirmation
//! - **State**: `ConnectionState` and `Role`

pub mod handshake;
pub mod state;

#[cfg(test)]
mod tests;
