//! # redsocket
//!
//! A point-to-point connection protocol with an optional TLS upgrade, and a
//! field-tagged binary codec for typed records sent over it.
//!
//! ## Layers
//! - [`core`]: type registry, scalar wire types, record codec
//! - [`protocol`]: handshake bytes and connection states
//! - [`transport`]: plain and TLS byte streams
//! - [`service`]: connection endpoints and the listener
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use redsocket::core::codec::Codec;
//! use redsocket::core::record::{FieldTable, Record};
//! use redsocket::service::{Acceptor, Connector, Listener};
//!
//! #[derive(Debug, Default)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! impl Record for Greeting {
//!     fn describe(fields: &mut FieldTable<Self>) {
//!         fields.field(0, |r| &r.text, |r| &mut r.text);
//!     }
//! }
//!
//! # async fn run() -> redsocket::error::Result<()> {
//! let mut codec = Codec::new();
//! codec.register::<Greeting>()?;
//! let codec = Arc::new(codec);
//!
//! let listener = Listener::new(Acceptor::new());
//! let (handle, mut incoming) = listener.start("127.0.0.1:0", 128).await?;
//!
//! let mut client = Connector::new(handle.local_addr().to_string()).connect().await?;
//! client.send(&codec, &Greeting { text: "hello".into() }).await?;
//!
//! if let Some(mut server) = incoming.recv().await {
//!     let greeting: Greeting = server.receive(&codec).await?;
//!     println!("{}", greeting.text);
//! }
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::codec::{AnyRecord, Codec, RecordCodec};
pub use crate::core::decimal::Decimal;
pub use crate::core::record::{FieldTable, Record};
pub use crate::error::{ProtocolError, Result};
pub use crate::service::{Acceptor, Connection, Connector, Listener};
