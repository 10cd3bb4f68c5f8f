//! # Type Registry
//!
//! Bidirectional mapping between wire class ids and registered record types.
//!
//! Class ids are handed out sequentially from 0 in registration order. Both ends
//! of a connection must register the same types in the same order; nothing on
//! the wire checks this. [`TypeRegistry::fingerprint`] gives a digest that can be
//! compared out of band.
//!
//! The registry is only mutated through `&mut self`, so a registry shared behind
//! an `Arc` is frozen for as long as encoders and decoders hold it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::Hash;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::record::{FieldTable, Record};
use crate::core::wire::Decoder;
use crate::error::{ProtocolError, Result};

/// A map that can be queried from either side.
///
/// Every left value maps to exactly one right value and vice versa.
#[derive(Debug, Clone)]
pub struct BiMap<L, R> {
    forward: HashMap<L, R>,
    reverse: HashMap<R, L>,
}

impl<L, R> Default for BiMap<L, R> {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

impl<L, R> BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair. Returns `false` and leaves the map untouched if either side is taken.
    pub fn insert(&mut self, left: L, right: R) -> bool {
        if self.forward.contains_key(&left) || self.reverse.contains_key(&right) {
            return false;
        }
        self.forward.insert(left.clone(), right.clone());
        self.reverse.insert(right, left);
        true
    }

    pub fn get_by_left(&self, left: &L) -> Option<&R> {
        self.forward.get(left)
    }

    pub fn get_by_right(&self, right: &R) -> Option<&L> {
        self.reverse.get(right)
    }

    pub fn remove_by_left(&mut self, left: &L) -> Option<R> {
        let right = self.forward.remove(left)?;
        self.reverse.remove(&right);
        Some(right)
    }

    pub fn remove_by_right(&mut self, right: &R) -> Option<L> {
        let left = self.reverse.remove(right)?;
        self.forward.remove(&left);
        Some(left)
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

type DecodeBoxedFn = fn(&mut Decoder<'_>) -> Result<Box<dyn Any + Send>>;

/// Everything the codec knows about one registered record type
pub struct TypeDescriptor {
    class_id: u32,
    type_id: TypeId,
    type_name: &'static str,
    field_indices: Vec<u16>,
    table: Box<dyn Any + Send + Sync>,
    decode_boxed: DecodeBoxedFn,
}

impl TypeDescriptor {
    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Declared field indices in table order
    pub fn field_indices(&self) -> &[u16] {
        &self.field_indices
    }

    pub(crate) fn decode_boxed(&self, decoder: &mut Decoder<'_>) -> Result<Box<dyn Any + Send>> {
        (self.decode_boxed)(decoder)
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("class_id", &self.class_id)
            .field("type_name", &self.type_name)
            .field("field_indices", &self.field_indices)
            .finish()
    }
}

fn decode_boxed<R: Record>(decoder: &mut Decoder<'_>) -> Result<Box<dyn Any + Send>> {
    let value: R = decoder.read_record_body()?;
    Ok(Box::new(value))
}

/// Class id ↔ record type registry
#[derive(Debug, Default)]
pub struct TypeRegistry {
    ids: BiMap<u32, TypeId>,
    descriptors: HashMap<TypeId, TypeDescriptor>,
    next_id: u32,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `R`, assigning it the next sequential class id.
    ///
    /// Fails with `AlreadyRegistered` if `R` is known, or `InvalidFieldTable`
    /// if its field table reuses an index or uses the reserved sentinel.
    pub fn register<R: Record>(&mut self) -> Result<u32> {
        let type_id = TypeId::of::<R>();
        if self.ids.get_by_right(&type_id).is_some() {
            return Err(ProtocolError::AlreadyRegistered(R::type_name()));
        }

        let table = FieldTable::<R>::build()?;
        let class_id = self.next_id;
        let field_indices = table.indices().collect();

        if !self.ids.insert(class_id, type_id) {
            return Err(ProtocolError::AlreadyRegistered(R::type_name()));
        }
        self.descriptors.insert(
            type_id,
            TypeDescriptor {
                class_id,
                type_id,
                type_name: R::type_name(),
                field_indices,
                table: Box::new(table),
                decode_boxed: decode_boxed::<R>,
            },
        );
        self.next_id += 1;

        debug!(class_id, type_name = R::type_name(), "Registered record type");
        Ok(class_id)
    }

    /// Look up the descriptor registered under `class_id`
    pub fn resolve_by_id(&self, class_id: u32) -> Result<&TypeDescriptor> {
        self.ids
            .get_by_left(&class_id)
            .and_then(|type_id| self.descriptors.get(type_id))
            .ok_or(ProtocolError::UnknownClassId(class_id))
    }

    /// Look up the class id assigned to `R`
    pub fn resolve_by_type<R: Record>(&self) -> Result<u32> {
        self.ids
            .get_by_right(&TypeId::of::<R>())
            .copied()
            .ok_or(ProtocolError::UnregisteredType(R::type_name()))
    }

    /// Field table for `R`, if registered
    pub(crate) fn table<R: Record>(&self) -> Result<&FieldTable<R>> {
        self.descriptors
            .get(&TypeId::of::<R>())
            .and_then(|d| d.table.downcast_ref::<FieldTable<R>>())
            .ok_or(ProtocolError::UnregisteredType(R::type_name()))
    }

    /// Resolve `class_id` and require it to name `R`
    pub(crate) fn expect<R: Record>(&self, class_id: u32) -> Result<&FieldTable<R>> {
        let descriptor = self.resolve_by_id(class_id)?;
        if descriptor.type_id != TypeId::of::<R>() {
            return Err(ProtocolError::TypeMismatch {
                expected: R::type_name(),
                found: descriptor.type_name,
            });
        }
        self.table::<R>()
    }

    /// Drop every registration and restart class ids at 0
    pub fn reset(&mut self) {
        self.ids.clear();
        self.descriptors.clear();
        self.next_id = 0;
        debug!("Type registry reset");
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Descriptors in class id order
    pub fn descriptors(&self) -> impl Iterator<Item = &TypeDescriptor> {
        (0..self.next_id).filter_map(move |id| self.resolve_by_id(id).ok())
    }

    /// SHA-256 over class ids, type names and field indices.
    ///
    /// Never sent on the wire; two processes that compute the same digest agree
    /// on class id assignment.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for descriptor in self.descriptors() {
            hasher.update(descriptor.class_id.to_le_bytes());
            hasher.update((descriptor.type_name.len() as u32).to_le_bytes());
            hasher.update(descriptor.type_name.as_bytes());
            for index in &descriptor.field_indices {
                hasher.update(index.to_le_bytes());
            }
        }
        hasher.finalize().into()
    }
}
