//! # Wire Primitives
//!
//! The closed set of scalar wire types plus the cursors that read and write
//! records.
//!
//! ## Scalar Encodings
//! ```text
//! u8  / i8          1 byte
//! u16 / i16         2 bytes LE
//! u32 / i32         4 bytes LE
//! u64 / i64         8 bytes LE
//! f32 / f64         IEEE-754, LE
//! Decimal           16 bytes: lo, mid, hi, flags (u32 LE each)
//! bool              1 byte, 0 = false
//! String            i32 LE byte length, then UTF-8 bytes, no terminator
//! ```
//!
//! ## Record Framing
//! ```text
//! [class_id u32] ([field_index u16] [kind u8] [payload])* [0xFFFF]
//! ```
//! Array payloads are an i32 LE element count followed by the elements.
//! Nested records (including array elements) carry their own class id.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::config::END_OF_RECORD;
use crate::core::decimal::Decimal;
use crate::core::record::{FieldTable, Record};
use crate::core::registry::TypeRegistry;
use crate::error::{ProtocolError, Result};

/// A value that can appear as a field element on the wire.
///
/// Implemented for the scalar set and, through [`Record`], for every record
/// type.
pub trait WireType: Sized + Send + Sync + 'static {
    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<()>;
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self>;
}

/// Write cursor over a byte buffer
pub struct Encoder<'a> {
    registry: &'a TypeRegistry,
    buf: &'a mut BytesMut,
}

impl<'a> Encoder<'a> {
    pub fn new(registry: &'a TypeRegistry, buf: &'a mut BytesMut) -> Self {
        Self { registry, buf }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a length or element count as i32 LE
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| ProtocolError::LengthOverflow(len))?;
        self.buf.put_i32_le(len);
        Ok(())
    }

    /// Write a complete record: class id, every declared field, sentinel
    pub fn write_record<R: Record>(&mut self, record: &R) -> Result<()> {
        let registry = self.registry;
        let class_id = registry.resolve_by_type::<R>()?;
        let table = registry.table::<R>()?;

        self.write_u32(class_id);
        for field in table.fields() {
            self.write_u16(field.index());
            self.write_u8(field.shape().kind_byte());
            field.write(record, self)?;
        }
        self.write_u16(END_OF_RECORD);
        Ok(())
    }
}

enum FieldStep {
    Field,
    EndOfRecord,
}

/// Read cursor over a byte slice.
///
/// Running out of input yields `ProtocolError::Truncated`; streaming callers
/// treat that as "wait for more bytes".
pub struct Decoder<'a> {
    registry: &'a TypeRegistry,
    buf: &'a [u8],
    start_len: usize,
    cancel: Option<&'a CancellationToken>,
    partial: bool,
    interrupted: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(registry: &'a TypeRegistry, buf: &'a [u8]) -> Self {
        Self {
            registry,
            buf,
            start_len: buf.len(),
            cancel: None,
            partial: false,
            interrupted: false,
        }
    }

    /// Check `token` once per field; when it fires the record being decoded is
    /// returned as populated so far.
    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Accept a record cut short by the end of input: whatever fields were
    /// complete are returned and the decode is marked interrupted.
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.start_len - self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Whether cancellation cut a record short
    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            Err(ProtocolError::Truncated)
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read an i32 LE length or element count
    pub fn read_len(&mut self) -> Result<usize> {
        let len = i32::from_le_bytes(self.read_array::<4>()?);
        usize::try_from(len).map_err(|_| ProtocolError::InvalidLength(len))
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// Read a class id, require it to name `R`, then read the fields
    pub fn read_record<R: Record>(&mut self) -> Result<R> {
        let class_id = self.read_u32()?;
        self.registry.expect::<R>(class_id)?;
        self.read_record_body()
    }

    /// Read fields until the sentinel, the class id having been consumed already
    pub(crate) fn read_record_body<R: Record>(&mut self) -> Result<R> {
        let registry = self.registry;
        let table = registry.table::<R>()?;
        let mut record = R::default();

        loop {
            if self.is_cancelled() {
                self.interrupted = true;
                return Ok(record);
            }

            match self.read_field(table, &mut record) {
                Ok(FieldStep::EndOfRecord) => return Ok(record),
                Ok(FieldStep::Field) if self.interrupted => return Ok(record),
                Ok(FieldStep::Field) => {}
                Err(ProtocolError::Truncated) if self.partial => {
                    self.interrupted = true;
                    return Ok(record);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_field<R: Record>(&mut self, table: &FieldTable<R>, record: &mut R) -> Result<FieldStep> {
        let index = self.read_u16()?;
        if index == END_OF_RECORD {
            return Ok(FieldStep::EndOfRecord);
        }

        let kind = self.read_u8()?;
        let field = table.get(index).ok_or(ProtocolError::UnknownField {
            type_name: R::type_name(),
            index,
        })?;
        if kind != field.shape().kind_byte() {
            return Err(ProtocolError::InvalidFieldKind { index, kind });
        }
        field.read(record, self)?;
        Ok(FieldStep::Field)
    }

    pub(crate) fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }
}

macro_rules! le_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireType for $ty {
                fn encode(&self, encoder: &mut Encoder<'_>) -> Result<()> {
                    encoder.write_bytes(&self.to_le_bytes());
                    Ok(())
                }

                fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
                    Ok(<$ty>::from_le_bytes(decoder.read_array()?))
                }
            }
        )*
    };
}

le_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl WireType for bool {
    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<()> {
        encoder.write_u8(u8::from(*self));
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        Ok(decoder.read_u8()? != 0)
    }
}

impl WireType for String {
    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<()> {
        encoder.write_len(self.len())?;
        encoder.write_bytes(self.as_bytes());
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let len = decoder.read_len()?;
        let bytes = decoder.read_slice(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl WireType for Decimal {
    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<()> {
        encoder.write_bytes(&self.to_bytes());
        Ok(())
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        Decimal::from_bytes(decoder.read_array()?)
    }
}

impl<R: Record> WireType for R {
    fn encode(&self, encoder: &mut Encoder<'_>) -> Result<()> {
        encoder.write_record(self)
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        decoder.read_record()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encode_scalar<T: WireType>(value: &T) -> Vec<u8> {
        let registry = TypeRegistry::new();
        let mut buf = BytesMut::new();
        value.encode(&mut Encoder::new(&registry, &mut buf)).unwrap();
        buf.to_vec()
    }

    fn decode_scalar<T: WireType>(bytes: &[u8]) -> Result<T> {
        let registry = TypeRegistry::new();
        T::decode(&mut Decoder::new(&registry, bytes))
    }

    #[test]
    fn test_integer_layouts_are_little_endian() {
        assert_eq!(encode_scalar(&0x1234u16), vec![0x34, 0x12]);
        assert_eq!(encode_scalar(&-2i32), vec![0xFE, 0xFF, 0xFF, 0xFF]);
        assert_eq!(encode_scalar(&1u64), vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_scalar(&-1i8), vec![0xFF]);
    }

    #[test]
    fn test_float_layouts() {
        assert_eq!(encode_scalar(&1.0f32), 1.0f32.to_le_bytes().to_vec());
        assert_eq!(decode_scalar::<f64>(&2.5f64.to_le_bytes()).unwrap(), 2.5);
    }

    #[test]
    fn test_bool_is_one_byte() {
        assert_eq!(encode_scalar(&true), vec![1]);
        assert_eq!(encode_scalar(&false), vec![0]);
        assert!(decode_scalar::<bool>(&[7]).unwrap());
    }

    #[test]
    fn test_string_has_length_prefix_and_no_terminator() {
        assert_eq!(
            encode_scalar(&String::from("hé")),
            vec![3, 0, 0, 0, b'h', 0xC3, 0xA9]
        );
        assert_eq!(encode_scalar(&String::new()), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_string_rejects_bad_input() {
        assert!(matches!(
            decode_scalar::<String>(&[2, 0, 0, 0, 0xFF, 0xFE]),
            Err(ProtocolError::InvalidUtf8)
        ));
        assert!(matches!(
            decode_scalar::<String>(&[5, 0, 0, 0, b'a']),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            decode_scalar::<String>(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::InvalidLength(-1))
        ));
    }

    #[test]
    fn test_short_input_is_truncated() {
        assert!(matches!(
            decode_scalar::<u32>(&[1, 2]),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_position_tracks_consumption() {
        let registry = TypeRegistry::new();
        let bytes = [1u8, 0, 2, 0, 0, 0, 9];
        let mut decoder = Decoder::new(&registry, &bytes);
        decoder.read_u16().unwrap();
        decoder.read_u32().unwrap();
        assert_eq!(decoder.position(), 6);
        assert_eq!(decoder.remaining(), 1);
    }
}
