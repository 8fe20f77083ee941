//! Generational write barrier.
//!
//! A young-generation collection only scans the young generation and the
//! store buffer, so every slot outside the young generation that may hold a
//! young reference must be in the store buffer. The barrier runs after each
//! pointer store and records the slot when an old (or otherwise non-young)
//! object starts referencing a young one.

use std::mem;

use crate::heap::Heap;
use crate::objects::{layout, Address, InstanceKind, Object};

/// How a code object embeds a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocMode {
    /// A full object pointer stored in the instruction stream.
    EmbeddedObject,
    /// A call or jump target.
    CodeTarget,
}

/// Location of a reference embedded in code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocInfo {
    /// Address of the embedded reference.
    pub pc: Address,
    /// How the reference is encoded.
    pub mode: RelocMode,
}

impl RelocInfo {
    /// Describes an embedded reference at `pc`.
    #[must_use]
    pub const fn new(pc: Address, mode: RelocMode) -> Self {
        Self { pc, mode }
    }
}

/// A store-buffer entry for a slot inside code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypedSlot {
    /// Code object containing the slot.
    pub host: Address,
    /// Encoding of the slot.
    pub slot_type: RelocMode,
    /// Address of the slot.
    pub address: Address,
}

/// Slots outside the young generation that may reference young objects.
///
/// Entries are appended without deduplication; the collector consumes them
/// with [`StoreBuffer::take_entries`] and [`StoreBuffer::take_typed_slots`].
#[derive(Debug, Default)]
pub struct StoreBuffer {
    entries: Vec<Address>,
    typed_slots: Vec<TypedSlot>,
}

impl StoreBuffer {
    pub(crate) fn insert_entry(&mut self, slot: Address) {
        self.entries.push(slot);
    }

    pub(crate) fn insert_typed_slot(&mut self, slot: TypedSlot) {
        self.typed_slots.push(slot);
    }

    /// Recorded untyped slots.
    #[must_use]
    pub fn entries(&self) -> &[Address] {
        &self.entries
    }

    /// Recorded slots inside code.
    #[must_use]
    pub fn typed_slots(&self) -> &[TypedSlot] {
        &self.typed_slots
    }

    /// Number of untyped entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.typed_slots.is_empty()
    }

    /// Removes and returns the untyped entries.
    pub fn take_entries(&mut self) -> Vec<Address> {
        mem::take(&mut self.entries)
    }

    /// Removes and returns the typed slots.
    pub fn take_typed_slots(&mut self) -> Vec<TypedSlot> {
        mem::take(&mut self.typed_slots)
    }
}

impl Heap {
    /// The store buffer.
    #[must_use]
    pub const fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    /// The store buffer, for a collector draining it.
    pub fn store_buffer_mut(&mut self) -> &mut StoreBuffer {
        &mut self.store_buffer
    }

    /// Write barrier for a store of `value` into `slot` of `object`.
    ///
    /// Records `slot` exactly when `value` is a young reference and `object`
    /// is a heap object outside the young generation.
    pub fn record_write(&mut self, object: Object, slot: Address, value: Object) {
        if !self.in_young_generation(value) {
            return;
        }
        if !object.is_heap_object() || self.in_young_generation(object) {
            return;
        }
        self.store_buffer.insert_entry(slot);
    }

    /// Write barrier for a reference embedded in code at `rinfo`.
    pub fn record_write_into_code(&mut self, host: Address, rinfo: RelocInfo, value: Object) {
        if self.in_young_generation(value) {
            self.record_write_into_code_slow(host, rinfo);
        }
    }

    fn record_write_into_code_slow(&mut self, host: Address, rinfo: RelocInfo) {
        debug_assert_eq!(self.kind_of(host), InstanceKind::Code);
        self.store_buffer.insert_typed_slot(TypedSlot {
            host,
            slot_type: rinfo.mode,
            address: rinfo.pc,
        });
    }

    /// Barrier for `length` elements starting at element `offset`, written
    /// without individual barriers. Records every element slot that now
    /// holds a young reference, unless the array itself is young.
    ///
    /// # Panics
    ///
    /// Panics if `array` is not a fixed array or the range exceeds its length.
    pub fn record_fixed_array_elements(&mut self, array: Address, offset: usize, length: usize) {
        if self.in_young_generation(Object::Heap(array)) {
            return;
        }
        assert_eq!(
            self.kind_of(array),
            InstanceKind::FixedArray,
            "element barrier on a non-array at {array}"
        );
        let array_length = self.fixed_array_length(array);
        assert!(
            offset + length <= array_length,
            "elements {offset}..{} out of bounds for length {array_length}",
            offset + length
        );

        for index in offset..offset + length {
            let slot = array.offset(layout::fixed_array_element_offset(index));
            let value = Object::from_word(self.read_word(slot));
            if self.in_young_generation(value) {
                self.store_buffer.insert_entry(slot);
            }
        }
    }

    /// Stores `value` at `object + offset` and runs the write barrier.
    pub fn write_field(&mut self, object: Address, offset: usize, value: Object) {
        let slot = object.offset(offset);
        self.write_word(slot, value.to_word());
        self.record_write(Object::Heap(object), slot, value);
    }

    /// Number of elements of a fixed array.
    #[must_use]
    pub fn fixed_array_length(&self, array: Address) -> usize {
        self.read_smi(array, layout::FIXED_ARRAY_LENGTH_OFFSET)
    }

    /// Loads element `index` of a fixed array.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn fixed_array_get(&self, array: Address, index: usize) -> Object {
        self.check_element_index(array, index);
        self.read_field(array, layout::fixed_array_element_offset(index))
    }

    /// Stores element `index` of a fixed array with a write barrier.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn fixed_array_set(&mut self, array: Address, index: usize, value: Object) {
        self.check_element_index(array, index);
        self.write_field(array, layout::fixed_array_element_offset(index), value);
    }

    fn check_element_index(&self, array: Address, index: usize) {
        let length = self.fixed_array_length(array);
        assert!(index < length, "index {index} out of bounds for length {length}");
    }
}
