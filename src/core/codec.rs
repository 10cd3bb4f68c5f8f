//! # Record Codec
//!
//! Turns registered records into tagged byte sequences and back.
//!
//! A [`Codec`] owns one [`TypeRegistry`]. Register every record type up front,
//! in the same order on both ends of a connection, then share the codec
//! (typically behind an `Arc`) for concurrent serialize/deserialize calls.
//!
//! [`RecordCodec`] adapts a codec to `tokio_util::codec` so a byte stream can be
//! wrapped in `Framed` and yield records as they complete. Records carry no
//! length prefix; the decoder re-parses buffered bytes until it sees the
//! end-of-record sentinel, and fails once an unfinished record outgrows the
//! configured size limit.
//!
//! ## Example
//! ```
//! use redsocket::core::codec::Codec;
//! use redsocket::core::record::{FieldTable, Record};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Ping {
//!     seq: u32,
//! }
//!
//! impl Record for Ping {
//!     fn describe(fields: &mut FieldTable<Self>) {
//!         fields.field(0, |r| &r.seq, |r| &mut r.seq);
//!     }
//! }
//!
//! let mut codec = Codec::new();
//! codec.register::<Ping>().unwrap();
//!
//! let bytes = codec.serialize(&Ping { seq: 7 }).unwrap();
//! assert_eq!(codec.deserialize::<Ping>(&bytes).unwrap(), Ping { seq: 7 });
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::record::Record;
use crate::core::registry::TypeRegistry;
use crate::config::MAX_RECORD_SIZE;
use crate::core::wire::{Decoder, Encoder};
use crate::error::{ProtocolError, Result};

/// Result of decoding one record from the front of a buffer
#[derive(Debug)]
pub struct Decoded<T> {
    /// The decoded record, partially populated if `interrupted`
    pub value: T,
    /// Bytes consumed from the input
    pub consumed: usize,
    /// Cancellation fired before the sentinel was reached
    pub interrupted: bool,
}

/// A decoded record whose type was chosen by its class id
pub struct AnyRecord {
    class_id: u32,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl AnyRecord {
    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<R: Record>(&self) -> bool {
        self.value.is::<R>()
    }

    pub fn downcast_ref<R: Record>(&self) -> Option<&R> {
        self.value.downcast_ref::<R>()
    }

    /// Take the concrete record, or get `self` back if it is another type
    pub fn downcast<R: Record>(self) -> std::result::Result<R, Self> {
        let Self {
            class_id,
            type_name,
            value,
        } = self;
        value.downcast::<R>().map(|boxed| *boxed).map_err(|value| Self {
            class_id,
            type_name,
            value,
        })
    }
}

impl fmt::Debug for AnyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyRecord")
            .field("class_id", &self.class_id)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Registry plus the serialize/deserialize entry points
#[derive(Debug, Default)]
pub struct Codec {
    registry: TypeRegistry,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `R` under the next class id
    pub fn register<R: Record>(&mut self) -> Result<u32> {
        self.registry.register::<R>()
    }

    /// Forget every registration
    pub fn reset(&mut self) {
        self.registry.reset();
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Encode `record` into a fresh buffer
    pub fn serialize<R: Record>(&self, record: &R) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.serialize_into(record, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoding of `record` to `buf`.
    ///
    /// On error `buf` is left as it was.
    pub fn serialize_into<R: Record>(&self, record: &R, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        let result = Encoder::new(&self.registry, buf).write_record(record);
        if result.is_err() {
            buf.truncate(start);
        }
        result?;
        trace!(
            type_name = R::type_name(),
            bytes = buf.len() - start,
            "Serialized record"
        );
        Ok(())
    }

    /// Decode one `R` from the front of `bytes`; trailing bytes are ignored
    pub fn deserialize<R: Record>(&self, bytes: &[u8]) -> Result<R> {
        self.decode_prefix(bytes, None).map(|decoded| decoded.value)
    }

    /// Decode one `R`, checking `cancel` before every field.
    ///
    /// If the token fires mid-record the partially populated record is
    /// returned with `interrupted` set instead of an error.
    pub fn deserialize_with_cancel<R: Record>(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Decoded<R>> {
        self.decode_prefix(bytes, Some(cancel))
    }

    /// Decode one record of whatever registered type its class id names
    pub fn deserialize_any(&self, bytes: &[u8]) -> Result<AnyRecord> {
        self.decode_any_prefix(bytes).map(|decoded| decoded.value)
    }

    /// Decode one `R` from the front of `bytes` and report how much was used
    pub fn decode_prefix<R: Record>(
        &self,
        bytes: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<Decoded<R>> {
        let mut decoder = Decoder::new(&self.registry, bytes);
        if let Some(token) = cancel {
            decoder = decoder.with_cancellation(token);
        }
        let value = decoder.read_record::<R>()?;
        Ok(Decoded {
            value,
            consumed: decoder.position(),
            interrupted: decoder.was_interrupted(),
        })
    }

    /// Decode as much of one `R` as `bytes` holds.
    ///
    /// A record missing its tail comes back with the complete fields set and
    /// `interrupted` flagged. The class id itself must be present.
    pub fn decode_partial<R: Record>(&self, bytes: &[u8]) -> Result<Decoded<R>> {
        let mut decoder = Decoder::new(&self.registry, bytes).partial();
        let value = decoder.read_record::<R>()?;
        Ok(Decoded {
            value,
            consumed: decoder.position(),
            interrupted: decoder.was_interrupted(),
        })
    }

    /// Dynamic counterpart of [`Codec::decode_prefix`]
    pub fn decode_any_prefix(&self, bytes: &[u8]) -> Result<Decoded<AnyRecord>> {
        let mut decoder = Decoder::new(&self.registry, bytes);
        let class_id = decoder.read_u32()?;
        let descriptor = decoder.registry().resolve_by_id(class_id)?;
        let value = descriptor.decode_boxed(&mut decoder)?;
        Ok(Decoded {
            value: AnyRecord {
                class_id,
                type_name: descriptor.type_name(),
                value,
            },
            consumed: decoder.position(),
            interrupted: false,
        })
    }

    /// SHA-256 over the registration table, for out-of-band comparison
    pub fn schema_fingerprint(&self) -> [u8; 32] {
        self.registry.fingerprint()
    }
}

/// `tokio_util` framing adapter over a shared [`Codec`]
#[derive(Debug, Clone)]
pub struct RecordCodec {
    codec: Arc<Codec>,
    max_record_size: usize,
}

impl RecordCodec {
    pub fn new(codec: Arc<Codec>) -> Self {
        Self {
            codec,
            max_record_size: MAX_RECORD_SIZE,
        }
    }

    /// Fail instead of buffering an unfinished record beyond `limit` bytes
    pub fn with_max_record_size(mut self, limit: usize) -> Self {
        self.max_record_size = limit;
        self
    }

    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }
}

impl codec::Decoder for RecordCodec {
    type Item = AnyRecord;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.codec.decode_any_prefix(src) {
            Ok(decoded) => {
                src.advance(decoded.consumed);
                Ok(Some(decoded.value))
            }
            Err(ProtocolError::Truncated) if src.len() > self.max_record_size => {
                Err(ProtocolError::RecordTooLarge {
                    buffered: src.len(),
                    limit: self.max_record_size,
                })
            }
            // Wait for the rest of the record
            Err(ProtocolError::Truncated) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Truncated),
        }
    }
}

impl<R: Record> codec::Encoder<R> for RecordCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: R, dst: &mut BytesMut) -> Result<()> {
        self.codec.serialize_into(&item, dst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::record::FieldTable;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    #[derive(Debug, Default, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl Record for Point {
        fn describe(fields: &mut FieldTable<Self>) {
            fields
                .field(0, |r| &r.x, |r| &mut r.x)
                .field(1, |r| &r.y, |r| &mut r.y);
        }
    }

    #[derive(Debug, Default, PartialEq)]
    struct Label {
        text: String,
    }

    impl Record for Label {
        fn describe(fields: &mut FieldTable<Self>) {
            fields.field(0, |r| &r.text, |r| &mut r.text);
        }
    }

    fn codec() -> Codec {
        let mut codec = Codec::new();
        codec.register::<Point>().unwrap();
        codec.register::<Label>().unwrap();
        codec
    }

    #[test]
    fn test_point_layout() {
        let bytes = codec().serialize(&Point { x: 1, y: -1 }).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[
                0, 0, 0, 0, // class id
                0, 0, 0, 1, 0, 0, 0, // x
                1, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, // y
                0xFF, 0xFF, // sentinel
            ]
        );
    }

    #[test]
    fn test_serialize_into_leaves_buffer_on_error() {
        let mut codec = Codec::new();
        codec.register::<Label>().unwrap();
        let mut buf = BytesMut::from(&b"keep"[..]);
        assert!(codec.serialize_into(&Point::default(), &mut buf).is_err());
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.serialize_into(&Point { x: 3, y: 4 }, &mut buf).unwrap();
        let first_len = buf.len();
        codec.serialize_into(&Label { text: "z".into() }, &mut buf).unwrap();

        let decoded = codec.decode_prefix::<Point>(&buf, None).unwrap();
        assert_eq!(decoded.consumed, first_len);
        assert!(!decoded.interrupted);
        assert_eq!(
            codec.deserialize::<Label>(&buf[first_len..]).unwrap().text,
            "z"
        );
    }

    #[test]
    fn test_deserialize_any_dispatches_on_class_id() {
        let codec = codec();
        let bytes = codec.serialize(&Label { text: "hi".into() }).unwrap();
        let any = codec.deserialize_any(&bytes).unwrap();
        assert_eq!(any.class_id(), 1);
        assert!(any.is::<Label>());
        assert!(!any.is::<Point>());
        let any = any.downcast::<Point>().unwrap_err();
        assert_eq!(any.downcast::<Label>().unwrap().text, "hi");
    }

    #[test]
    fn test_record_codec_waits_for_sentinel() {
        let codec = Arc::new(codec());
        let mut framing = RecordCodec::new(codec.clone());
        let mut wire = BytesMut::new();
        framing.encode(Point { x: 5, y: 6 }, &mut wire).unwrap();
        framing.encode(Label { text: "next".into() }, &mut wire).unwrap();

        let mut src = BytesMut::new();
        let split = 7;
        src.extend_from_slice(&wire[..split]);
        assert!(framing.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), split);

        src.extend_from_slice(&wire[split..]);
        let first = framing.decode(&mut src).unwrap().unwrap();
        assert_eq!(first.downcast_ref::<Point>(), Some(&Point { x: 5, y: 6 }));
        let second = framing.decode(&mut src).unwrap().unwrap();
        assert_eq!(second.downcast_ref::<Label>().unwrap().text, "next");
        assert!(src.is_empty());
    }

    #[test]
    fn test_record_codec_eof_with_partial_record() {
        let codec = Arc::new(codec());
        let mut framing = RecordCodec::new(codec.clone());
        let bytes = codec.serialize(&Point::default()).unwrap();
        let mut src = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            framing.decode_eof(&mut src),
            Err(ProtocolError::Truncated)
        ));
        assert!(framing.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn test_record_codec_rejects_oversized_partial_record() {
        let codec = Arc::new(codec());
        let mut framing = RecordCodec::new(codec).with_max_record_size(1024);

        // Label whose text claims i32::MAX bytes
        let mut src = BytesMut::new();
        src.extend_from_slice(&1u32.to_le_bytes());
        src.extend_from_slice(&[0, 0, 0]);
        src.extend_from_slice(&i32::MAX.to_le_bytes());
        src.extend_from_slice(&[b'a'; 512]);
        assert!(framing.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&[b'a'; 1024]);
        assert!(matches!(
            framing.decode(&mut src),
            Err(ProtocolError::RecordTooLarge { limit: 1024, .. })
        ));
    }

    #[test]
    fn test_fingerprint_changes_with_registrations() {
        let mut codec = Codec::new();
        let empty = codec.schema_fingerprint();
        codec.register::<Point>().unwrap();
        assert_ne!(empty, codec.schema_fingerprint());
        codec.reset();
        assert_eq!(empty, codec.schema_fingerprint());
    }
}
