//! # Service Layer
//!
//! Connection endpoints and the listener that produces them.
//!
//! ## Components
//! - **Connection**: `Connector` (initiator), `Acceptor`, and the `Connection` endpoint
//! - **Listener**: bind, authorize, hand established connections to the caller

pub mod connection;
pub mod listener;

pub use connection::{Acceptor, Connection, Connector};
pub use listener::{Authorizer, Listener, ListenerHandle};
