//! Object model: addresses, tagged words and type descriptors.
//!
//! Heap memory is a sequence of 64-bit words. The first word of every object
//! references its [`Descriptor`], a small record in descriptor space that
//! carries the object's [`InstanceKind`] and instance size. Slots hold
//! [`Object`] values encoded with [`Object::to_word`].

use std::fmt;

use crate::heap::Heap;

/// Size of a heap word in bytes.
pub const WORD_SIZE: usize = 8;

/// Alignment requested by [`AllocationAlignment::DoubleAligned`].
///
/// [`AllocationAlignment::DoubleAligned`]: crate::AllocationAlignment::DoubleAligned
pub const DOUBLE_ALIGNMENT: usize = 8;

const HEAP_OBJECT_TAG: u64 = 1;

// ============================================================================
// Address
// ============================================================================

/// A byte address inside (or, for stale values, formerly inside) the heap.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wraps a raw address.
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw address.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Returns `true` for [`Address::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one.
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Distance in bytes from `base` up to this address.
    #[must_use]
    pub const fn offset_from(self, base: Self) -> usize {
        self.0 - base.0
    }

    /// Whether the address is a multiple of [`WORD_SIZE`].
    #[must_use]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ============================================================================
// Object - tagged slot values
// ============================================================================

/// A value stored in a heap slot: either a small integer or a reference to a
/// heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Object {
    /// Small integer, 63 bits of payload.
    Smi(i64),
    /// Reference to the heap object starting at the address.
    Heap(Address),
}

impl Object {
    /// Encodes the value as a heap word. References carry a set low bit;
    /// object addresses are word aligned so the bit is otherwise free.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_word(self) -> u64 {
        match self {
            Self::Smi(value) => (value as u64) << 1,
            Self::Heap(address) => address.raw() as u64 | HEAP_OBJECT_TAG,
        }
    }

    /// Decodes a heap word.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub const fn from_word(word: u64) -> Self {
        if word & HEAP_OBJECT_TAG == 0 {
            Self::Smi((word as i64) >> 1)
        } else {
            Self::Heap(Address::new((word & !HEAP_OBJECT_TAG) as usize))
        }
    }

    /// Returns `true` if this value references a heap object.
    #[must_use]
    pub const fn is_heap_object(self) -> bool {
        matches!(self, Self::Heap(_))
    }

    /// Address of the referenced object, if any.
    #[must_use]
    pub const fn heap_address(self) -> Option<Address> {
        match self {
            Self::Heap(address) => Some(address),
            Self::Smi(_) => None,
        }
    }
}

impl From<Address> for Object {
    fn from(address: Address) -> Self {
        Self::Heap(address)
    }
}

// ============================================================================
// InstanceKind
// ============================================================================

/// Kind of a heap object, stored in its descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum InstanceKind {
    /// A type descriptor.
    Meta = 1,
    /// One-word filler left behind by alignment.
    Filler = 2,
    /// Length-prefixed array of tagged slots.
    FixedArray = 3,
    /// Trailer recording the allocation site of the preceding object.
    AllocationMemento = 4,
    /// String whose characters live outside the heap.
    ExternalString = 5,
    /// Function metadata whose address is known to code bookkeeping.
    SharedFunctionInfo = 6,
    /// Generated machine code.
    Code = 7,
    /// Plain object with a fixed number of in-object fields.
    JsObject = 8,
    /// Array object.
    JsArray = 9,
}

impl InstanceKind {
    /// Decodes the kind word of a descriptor.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            1 => Self::Meta,
            2 => Self::Filler,
            3 => Self::FixedArray,
            4 => Self::AllocationMemento,
            5 => Self::ExternalString,
            6 => Self::SharedFunctionInfo,
            7 => Self::Code,
            8 => Self::JsObject,
            9 => Self::JsArray,
            _ => return None,
        })
    }

    /// Whether allocations of this kind carry mementos and feed pretenuring.
    #[must_use]
    pub const fn can_track_allocation_site(self) -> bool {
        matches!(self, Self::JsObject | Self::JsArray)
    }

    /// Whether the object size depends on a length stored in the object.
    #[must_use]
    pub const fn is_variable_size(self) -> bool {
        matches!(self, Self::FixedArray | Self::Code)
    }
}

/// Field offsets and fixed sizes of the built-in object kinds.
pub mod layout {
    use super::WORD_SIZE;

    /// Offset of the descriptor word, shared by every object.
    pub const DESCRIPTOR_OFFSET: usize = 0;

    /// Descriptor: kind word.
    pub const DESCRIPTOR_KIND_OFFSET: usize = WORD_SIZE;
    /// Descriptor: instance size word (0 for variable-size kinds).
    pub const DESCRIPTOR_INSTANCE_SIZE_OFFSET: usize = 2 * WORD_SIZE;
    /// Size of a descriptor record.
    pub const DESCRIPTOR_SIZE: usize = 3 * WORD_SIZE;

    /// Size of a filler object.
    pub const FILLER_SIZE: usize = WORD_SIZE;

    /// Fixed array: length (Smi).
    pub const FIXED_ARRAY_LENGTH_OFFSET: usize = WORD_SIZE;
    /// Fixed array: first element.
    pub const FIXED_ARRAY_HEADER_SIZE: usize = 2 * WORD_SIZE;

    /// Memento: allocation site id (Smi).
    pub const MEMENTO_SITE_OFFSET: usize = WORD_SIZE;
    /// Size of an allocation memento.
    pub const MEMENTO_SIZE: usize = 2 * WORD_SIZE;

    /// External string: character count (Smi).
    pub const EXTERNAL_STRING_LENGTH_OFFSET: usize = WORD_SIZE;
    /// External string: resource handle (Smi, 0 once finalized).
    pub const EXTERNAL_STRING_RESOURCE_OFFSET: usize = 2 * WORD_SIZE;
    /// Size of an external string.
    pub const EXTERNAL_STRING_SIZE: usize = 3 * WORD_SIZE;

    /// Code: body size in bytes (Smi).
    pub const CODE_BODY_SIZE_OFFSET: usize = WORD_SIZE;
    /// Code: first byte of the body.
    pub const CODE_HEADER_SIZE: usize = 2 * WORD_SIZE;

    /// Size of a shared function info.
    pub const SHARED_FUNCTION_INFO_SIZE: usize = 4 * WORD_SIZE;

    /// Size of an array object (descriptor, properties, elements, length).
    pub const JS_ARRAY_SIZE: usize = 4 * WORD_SIZE;

    /// Offset of element `index` in a fixed array.
    #[must_use]
    pub const fn fixed_array_element_offset(index: usize) -> usize {
        FIXED_ARRAY_HEADER_SIZE + index * WORD_SIZE
    }

    /// Size of a fixed array of `length` elements.
    #[must_use]
    pub const fn fixed_array_size_for(length: usize) -> usize {
        fixed_array_element_offset(length)
    }

    /// Size of a code object with a body of `body_size` bytes, rounded up to
    /// whole words.
    #[must_use]
    pub const fn code_size_for(body_size: usize) -> usize {
        CODE_HEADER_SIZE + body_size.div_ceil(WORD_SIZE) * WORD_SIZE
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Reference to a type descriptor record.
///
/// Two objects have the same type exactly when their descriptor words are
/// equal, so descriptor identity is address identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor(Address);

impl From<Address> for Descriptor {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

impl Descriptor {
    /// Address of the descriptor record.
    #[must_use]
    pub const fn address(self) -> Address {
        self.0
    }

    /// The descriptor word objects of this type start with.
    #[must_use]
    pub const fn to_word(self) -> u64 {
        Object::Heap(self.0).to_word()
    }

    /// Kind of the objects this descriptor describes.
    ///
    /// # Panics
    ///
    /// Panics if the record does not hold a valid kind word.
    #[must_use]
    pub fn kind(self, heap: &Heap) -> InstanceKind {
        let raw = heap.read_word(self.0.offset(layout::DESCRIPTOR_KIND_OFFSET));
        InstanceKind::from_raw(raw)
            .unwrap_or_else(|| panic!("corrupt type descriptor at {}: kind word {raw:#x}", self.0))
    }

    /// Instance size recorded in the descriptor; 0 for variable-size kinds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn instance_size(self, heap: &Heap) -> usize {
        heap.read_word(self.0.offset(layout::DESCRIPTOR_INSTANCE_SIZE_OFFSET)) as usize
    }

    /// Size in bytes of `object`, which must be of this type.
    #[must_use]
    pub fn size_of(self, heap: &Heap, object: Address) -> usize {
        match self.kind(heap) {
            InstanceKind::FixedArray => {
                layout::fixed_array_size_for(heap.read_smi(object, layout::FIXED_ARRAY_LENGTH_OFFSET))
            }
            InstanceKind::Code => {
                layout::code_size_for(heap.read_smi(object, layout::CODE_BODY_SIZE_OFFSET))
            }
            _ => self.instance_size(heap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_words_keep_low_bit_clear() {
        for value in [0, 1, -1, 42, i64::MAX >> 1, i64::MIN >> 1] {
            let word = Object::Smi(value).to_word();
            assert_eq!(word & HEAP_OBJECT_TAG, 0);
            assert_eq!(Object::from_word(word), Object::Smi(value));
        }
    }

    #[test]
    fn zeroed_memory_decodes_as_smi_zero() {
        assert_eq!(Object::from_word(0), Object::Smi(0));
        assert!(!Object::from_word(0).is_heap_object());
    }

    #[test]
    fn heap_references_round_trip_through_the_tag() {
        let address = Address::new(0x7f00_0000_1230);
        let word = Object::Heap(address).to_word();
        assert_eq!(word & HEAP_OBJECT_TAG, HEAP_OBJECT_TAG);
        assert_eq!(Object::from_word(word).heap_address(), Some(address));
    }

    #[test]
    fn only_object_kinds_are_trackable() {
        assert!(InstanceKind::JsObject.can_track_allocation_site());
        assert!(InstanceKind::JsArray.can_track_allocation_site());
        assert!(!InstanceKind::FixedArray.can_track_allocation_site());
        assert!(!InstanceKind::ExternalString.can_track_allocation_site());
    }

    #[test]
    fn instance_kind_rejects_unknown_words() {
        assert_eq!(InstanceKind::from_raw(0), None);
        assert_eq!(InstanceKind::from_raw(3), Some(InstanceKind::FixedArray));
        assert_eq!(InstanceKind::from_raw(10), None);
    }

    #[test]
    fn code_size_rounds_to_words() {
        assert_eq!(layout::code_size_for(0), layout::CODE_HEADER_SIZE);
        assert_eq!(layout::code_size_for(1), layout::CODE_HEADER_SIZE + WORD_SIZE);
        assert_eq!(layout::code_size_for(16), layout::CODE_HEADER_SIZE + 16);
    }
}
