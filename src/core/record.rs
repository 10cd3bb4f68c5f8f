//! # Record Descriptors
//!
//! A record is a struct whose fields travel as `(field_index, kind, payload)`
//! triples. Each record type declares an explicit field table once; the
//! registry builds and validates it at registration time.
//!
//! ```
//! use redsocket::core::record::{FieldTable, Record};
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Login {
//!     user: String,
//!     attempts: u32,
//!     tags: Vec<String>,
//! }
//!
//! impl Record for Login {
//!     fn describe(fields: &mut FieldTable<Self>) {
//!         fields
//!             .field(0, |r| &r.user, |r| &mut r.user)
//!             .field(1, |r| &r.attempts, |r| &mut r.attempts)
//!             .array(2, |r| &r.tags, |r| &mut r.tags);
//!     }
//! }
//! ```
//!
//! Field indices are author-assigned tags. They must be unique within a record
//! and must not be `0xFFFF`, which marks the end of a record on the wire.

use std::collections::HashMap;

use crate::config::{END_OF_RECORD, KIND_ARRAY, KIND_SINGLE};
use crate::core::wire::{Decoder, Encoder, WireType};
use crate::error::{ProtocolError, Result};

/// Upper bound, in bytes, on the storage reserved for an array before its
/// elements are decoded
const MAX_PREALLOCATION: usize = 64 * 1024;

/// A struct that can be encoded as a tagged record.
///
/// `Default` supplies the empty instance fields are decoded into.
pub trait Record: Default + Send + Sync + 'static {
    /// Declare the tagged fields of this record
    fn describe(fields: &mut FieldTable<Self>);

    /// Name used in errors and the registry fingerprint
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Whether a field holds one element or a homogeneous array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Single,
    Array,
}

impl FieldShape {
    pub fn kind_byte(self) -> u8 {
        match self {
            FieldShape::Single => KIND_SINGLE,
            FieldShape::Array => KIND_ARRAY,
        }
    }
}

type WriteFn<R> = Box<dyn Fn(&R, &mut Encoder<'_>) -> Result<()> + Send + Sync>;
type ReadFn<R> = Box<dyn Fn(&mut R, &mut Decoder<'_>) -> Result<()> + Send + Sync>;

/// One entry of a field table: index, shape and the payload codec functions
pub struct Field<R> {
    index: u16,
    shape: FieldShape,
    element: &'static str,
    write: WriteFn<R>,
    read: ReadFn<R>,
}

impl<R> Field<R> {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn shape(&self) -> FieldShape {
        self.shape
    }

    /// Rust type name of the element
    pub fn element(&self) -> &'static str {
        self.element
    }

    pub(crate) fn write(&self, record: &R, encoder: &mut Encoder<'_>) -> Result<()> {
        (self.write)(record, encoder)
    }

    pub(crate) fn read(&self, record: &mut R, decoder: &mut Decoder<'_>) -> Result<()> {
        (self.read)(record, decoder)
    }
}

/// Field descriptors for one record type
pub struct FieldTable<R> {
    fields: Vec<Field<R>>,
    lookup: HashMap<u16, usize>,
}

impl<R: Record> FieldTable<R> {
    fn empty() -> Self {
        Self {
            fields: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Run `R::describe` and validate the result
    pub(crate) fn build() -> Result<Self> {
        let mut table = Self::empty();
        R::describe(&mut table);

        for (position, field) in table.fields.iter().enumerate() {
            if field.index == END_OF_RECORD {
                return Err(ProtocolError::InvalidFieldTable {
                    type_name: R::type_name(),
                    reason: format!("field index {END_OF_RECORD:#06x} is reserved"),
                });
            }
            if table.lookup.insert(field.index, position).is_some() {
                return Err(ProtocolError::InvalidFieldTable {
                    type_name: R::type_name(),
                    reason: format!("field index {} declared twice", field.index),
                });
            }
        }
        Ok(table)
    }

    /// Declare a single-element field
    pub fn field<T: WireType>(
        &mut self,
        index: u16,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> &mut Self {
        self.fields.push(Field {
            index,
            shape: FieldShape::Single,
            element: std::any::type_name::<T>(),
            write: Box::new(move |record: &R, encoder: &mut Encoder<'_>| {
                get(record).encode(encoder)
            }),
            read: Box::new(move |record: &mut R, decoder: &mut Decoder<'_>| {
                *get_mut(record) = T::decode(decoder)?;
                Ok(())
            }),
        });
        self
    }

    /// Declare an array field; elements share the declared element type
    pub fn array<T: WireType>(
        &mut self,
        index: u16,
        get: fn(&R) -> &Vec<T>,
        get_mut: fn(&mut R) -> &mut Vec<T>,
    ) -> &mut Self {
        self.fields.push(Field {
            index,
            shape: FieldShape::Array,
            element: std::any::type_name::<T>(),
            write: Box::new(move |record: &R, encoder: &mut Encoder<'_>| {
                let items = get(record);
                encoder.write_len(items.len())?;
                items.iter().try_for_each(|item| item.encode(encoder))
            }),
            read: Box::new(move |record: &mut R, decoder: &mut Decoder<'_>| {
                let count = decoder.read_len()?;
                // The count is peer-controlled; cap the up-front reservation in bytes
                let reserve = count
                    .min(decoder.remaining())
                    .min(MAX_PREALLOCATION / std::mem::size_of::<T>().max(1));
                let mut items = Vec::with_capacity(reserve);
                for _ in 0..count {
                    items.push(T::decode(decoder)?);
                    if decoder.was_interrupted() {
                        break;
                    }
                }
                *get_mut(record) = items;
                Ok(())
            }),
        });
        self
    }
}

impl<R> FieldTable<R> {
    /// Fields in declaration order
    pub fn fields(&self) -> &[Field<R>] {
        &self.fields
    }

    pub fn get(&self, index: u16) -> Option<&Field<R>> {
        self.lookup.get(&index).map(|&position| &self.fields[position])
    }

    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.fields.iter().map(|f| f.index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
