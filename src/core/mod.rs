//! # Core Codec Components
//!
//! Type registry, scalar wire types and the tagged record codec.
//!
//! ## Components
//! - **Registry**: bidirectional class id ↔ record type mapping
//! - **Record**: explicit per-type field tables
//! - **Wire**: scalar encodings and the encode/decode cursors
//! - **Codec**: serialize/deserialize entry points and stream framing
//!
//! ## Wire Format
//! ```text
//! [class_id u32] ([field_index u16] [kind u8] [payload])* [0xFFFF]
//! ```
//!
//! ## Safety
//! - Array capacity is bounded by the bytes actually buffered, never by the
//!   count read off the wire
//! - Unknown class ids, unknown fields and bad kind bytes fail the decode
//! - Type graphs must be acyclic; nothing detects self-referential records

pub mod codec;
pub mod decimal;
pub mod record;
pub mod registry;
pub mod wire;
