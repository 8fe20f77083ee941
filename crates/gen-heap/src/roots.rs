//! Well-known objects created when the heap is set up.

use gen_heap_derive::RootTable;

use crate::objects::{Address, Descriptor};

/// Names of the root table entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, RootTable)]
#[root_table(table = Roots, value = Address)]
pub enum RootId {
    /// Descriptor of descriptors; its descriptor word points at itself.
    #[root(ty = Descriptor)]
    MetaDescriptor,
    /// Descriptor of one-word fillers.
    #[root(ty = Descriptor)]
    FillerDescriptor,
    /// Descriptor of fixed arrays.
    #[root(ty = Descriptor)]
    FixedArrayDescriptor,
    /// Descriptor of allocation mementos.
    #[root(ty = Descriptor)]
    AllocationMementoDescriptor,
    /// Descriptor of external strings.
    #[root(ty = Descriptor)]
    ExternalStringDescriptor,
    /// Descriptor of shared function infos.
    #[root(ty = Descriptor)]
    SharedFunctionInfoDescriptor,
    /// Descriptor of code objects.
    #[root(ty = Descriptor)]
    CodeDescriptor,
    /// Descriptor of array objects.
    #[root(ty = Descriptor)]
    JsArrayDescriptor,
    /// Shared zero-length fixed array, allocated in old space.
    EmptyFixedArray,
}

/// Table of root objects. Roots never live in the young generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Roots {
    entries: [Address; RootId::COUNT],
}

impl Roots {
    pub(crate) const fn new() -> Self {
        Self {
            entries: [Address::NULL; RootId::COUNT],
        }
    }

    /// Address stored for `id`.
    #[must_use]
    pub const fn get(&self, id: RootId) -> Address {
        self.entries[id.index()]
    }

    pub(crate) fn set(&mut self, id: RootId, value: Address) {
        self.entries[id.index()] = value;
    }

    /// Iterates every root in table order.
    pub fn iter(&self) -> impl Iterator<Item = (RootId, Address)> + '_ {
        RootId::ALL.into_iter().map(|id| (id, self.get(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_accessors_read_their_slot() {
        let mut roots = Roots::new();
        roots.set(RootId::FixedArrayDescriptor, Address::new(0x2000));
        roots.set(RootId::EmptyFixedArray, Address::new(0x3000));

        assert_eq!(roots.fixed_array_descriptor().address(), Address::new(0x2000));
        assert_eq!(roots.empty_fixed_array(), Address::new(0x3000));
        assert_eq!(roots.meta_descriptor().address(), Address::NULL);
    }

    #[test]
    fn ids_are_indexed_in_declaration_order() {
        assert_eq!(RootId::COUNT, 9);
        assert_eq!(RootId::MetaDescriptor.index(), 0);
        assert_eq!(RootId::EmptyFixedArray.index(), RootId::COUNT - 1);
        assert_eq!(RootId::JsArrayDescriptor.name(), "js_array_descriptor");
        assert_eq!(Roots::new().iter().count(), RootId::COUNT);
    }
}
