//! Strings whose characters live outside the heap.
//!
//! The heap object stores only a length and a handle into the heap's
//! resource registry. The [`ExternalStringTable`] lists every registered
//! string so its resource can be released when the string dies or the heap is
//! torn down.

use std::collections::HashMap;
use std::fmt;

use crate::heap::{smi_from_usize, Heap};
use crate::objects::{layout, Address, InstanceKind, Object};
use crate::space::{AllocationAlignment, AllocationResult, AllocationSpace};

/// Owner of the characters of an external string.
pub trait ExternalStringResource: Send + Sync {
    /// The characters.
    fn data(&self) -> &[u8];

    /// Releases the resource. Called at most once, when the string is
    /// finalized.
    fn dispose(self: Box<Self>) {}
}

impl ExternalStringResource for String {
    fn data(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ExternalStringResource for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }
}

/// Resources indexed by the handle stored in their string. Handle 0 means
/// "no resource".
#[derive(Default)]
pub(crate) struct ExternalResourceRegistry {
    next_handle: i64,
    resources: HashMap<i64, Box<dyn ExternalStringResource>>,
}

impl ExternalResourceRegistry {
    fn insert(&mut self, resource: Box<dyn ExternalStringResource>) -> i64 {
        self.next_handle += 1;
        self.resources.insert(self.next_handle, resource);
        self.next_handle
    }

    fn get(&self, handle: i64) -> Option<&dyn ExternalStringResource> {
        self.resources.get(&handle).map(Box::as_ref)
    }

    fn take(&mut self, handle: i64) -> Option<Box<dyn ExternalStringResource>> {
        self.resources.remove(&handle)
    }

    /// Disposes resources whose strings were never finalized.
    pub(crate) fn dispose_all(&mut self) {
        for (_, resource) in self.resources.drain() {
            resource.dispose();
        }
    }
}

impl fmt::Debug for ExternalResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalResourceRegistry")
            .field("live", &self.resources.len())
            .finish()
    }
}

/// Registered external strings, split by generation.
#[derive(Debug, Default)]
pub struct ExternalStringTable {
    young_strings: Vec<Address>,
    old_strings: Vec<Address>,
}

impl ExternalStringTable {
    /// Strings registered while in the young generation.
    #[must_use]
    pub fn young_strings(&self) -> &[Address] {
        &self.young_strings
    }

    /// Strings registered in, or promoted to, the old generation.
    #[must_use]
    pub fn old_strings(&self) -> &[Address] {
        &self.old_strings
    }

    /// Entries of the young list, for a collector rewriting them to the
    /// strings' new addresses.
    pub fn young_strings_mut(&mut self) -> &mut Vec<Address> {
        &mut self.young_strings
    }

    /// Total number of registered strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.young_strings.len() + self.old_strings.len()
    }

    /// Returns `true` if no string is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.young_strings.is_empty() && self.old_strings.is_empty()
    }
}

impl Heap {
    /// The external string table.
    #[must_use]
    pub const fn external_string_table(&self) -> &ExternalStringTable {
        &self.external_string_table
    }

    /// Allocates an external string with no resource attached.
    pub fn allocate_external_string(&mut self, space: AllocationSpace) -> AllocationResult {
        let result = self.allocate_raw(
            layout::EXTERNAL_STRING_SIZE,
            space,
            AllocationAlignment::WordAligned,
        );
        if let AllocationResult::Success(string) = result {
            let descriptor = self.roots.external_string_descriptor();
            self.write_word(string, descriptor.to_word());
            let zero = Object::Smi(0).to_word();
            self.write_word(string.offset(layout::EXTERNAL_STRING_LENGTH_OFFSET), zero);
            self.write_word(string.offset(layout::EXTERNAL_STRING_RESOURCE_OFFSET), zero);
        }
        result
    }

    /// Hands `resource` to `string`. The heap owns it from now on.
    ///
    /// # Panics
    ///
    /// Panics if `string` is not an external string or already has a
    /// resource.
    pub fn set_external_resource(
        &mut self,
        string: Address,
        resource: Box<dyn ExternalStringResource>,
    ) {
        self.assert_external_string(string);
        assert_eq!(
            self.resource_handle(string),
            0,
            "external string at {string} already has a resource"
        );
        let length = resource.data().len();
        let handle = self.external_resources.insert(resource);
        self.write_word(
            string.offset(layout::EXTERNAL_STRING_LENGTH_OFFSET),
            smi_from_usize(length).to_word(),
        );
        self.write_word(
            string.offset(layout::EXTERNAL_STRING_RESOURCE_OFFSET),
            Object::Smi(handle).to_word(),
        );
    }

    /// Adds `string` to the young or old list according to its current
    /// generation.
    ///
    /// # Panics
    ///
    /// Panics if `string` is not an external string.
    pub fn register_external_string(&mut self, string: Address) {
        self.assert_external_string(string);
        if self.in_young_generation(Object::Heap(string)) {
            self.external_string_table.young_strings.push(string);
        } else {
            self.external_string_table.old_strings.push(string);
        }
    }

    /// Releases the resource of `string` and clears its handle. A second
    /// call finds the handle cleared and does nothing.
    ///
    /// # Panics
    ///
    /// Panics if `string` is not an external string.
    pub fn finalize_external_string(&mut self, string: Address) {
        self.assert_external_string(string);
        let handle = self.resource_handle(string);
        if handle == 0 {
            return;
        }
        if let Some(resource) = self.external_resources.take(handle) {
            resource.dispose();
        }
        self.write_word(
            string.offset(layout::EXTERNAL_STRING_RESOURCE_OFFSET),
            Object::Smi(0).to_word(),
        );

        #[cfg(feature = "tracing")]
        crate::tracing::log_external_string_finalized(string);
    }

    /// Characters of `string`, or `None` once it has been finalized.
    #[must_use]
    pub fn external_string_data(&self, string: Address) -> Option<&[u8]> {
        self.assert_external_string(string);
        self.external_resources
            .get(self.resource_handle(string))
            .map(|resource| resource.data())
    }

    /// Moves entries for strings no longer in the young generation to the
    /// old list. The collector calls this after updating the young entries
    /// to the strings' new addresses.
    pub fn clean_up_young_external_strings(&mut self) {
        let young = std::mem::take(&mut self.external_string_table.young_strings);
        for string in young {
            if self.in_young_generation(Object::Heap(string)) {
                self.external_string_table.young_strings.push(string);
            } else {
                self.external_string_table.old_strings.push(string);
            }
        }
    }

    /// Moves every young entry to the old list.
    pub fn promote_all_young_external_strings(&mut self) {
        let table = &mut self.external_string_table;
        table.old_strings.append(&mut table.young_strings);
    }

    /// Mutable access for a collector rewriting entries of moved strings.
    pub fn external_string_table_mut(&mut self) -> &mut ExternalStringTable {
        &mut self.external_string_table
    }

    /// Finalizes every registered string and empties the table.
    pub fn tear_down_external_strings(&mut self) {
        let young = std::mem::take(&mut self.external_string_table.young_strings);
        let old = std::mem::take(&mut self.external_string_table.old_strings);
        for string in young.into_iter().chain(old) {
            self.finalize_external_string(string);
        }
    }

    fn resource_handle(&self, string: Address) -> i64 {
        match self.read_field(string, layout::EXTERNAL_STRING_RESOURCE_OFFSET) {
            Object::Smi(handle) => handle,
            Object::Heap(address) => {
                panic!("external string at {string} holds a reference {address} as its resource")
            }
        }
    }

    fn assert_external_string(&self, string: Address) {
        let kind = self.kind_of(string);
        assert_eq!(
            kind,
            InstanceKind::ExternalString,
            "{string} is a {kind:?}, not an external string"
        );
    }
}
