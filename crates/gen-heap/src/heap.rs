//! The heap: spaces, the allocation dispatcher and generation queries.
//!
//! # Layout
//!
//! ```text
//! Heap
//!  ├─ PageArena ─ every mapped page, looked up by address
//!  ├─ YoungSpace            fixed to-space pages, reset by each young GC
//!  ├─ PagedSpace (old)      grows a page at a time
//!  ├─ PagedSpace (code)     executable pages
//!  ├─ PagedSpace (descr.)   type descriptors
//!  └─ LargeObjectSpace      one page per object
//! ```
//!
//! All allocation funnels through [`Heap::allocate_raw`], which decides the
//! destination space from the requested space and the object size and
//! reports [`AllocationResult::Retry`] when a collection is needed first.

use std::io;
use std::time::Instant;

use crate::barrier::StoreBuffer;
use crate::config::HeapConfig;
use crate::external_strings::{ExternalResourceRegistry, ExternalStringTable};
use crate::instrumentation::{AllocationTracker, Observers};
use crate::objects::{layout, Address, Descriptor, InstanceKind, Object, WORD_SIZE};
use crate::page::{Page, PageArena, PageFlags, PageId};
use crate::pretenuring::{AllocationSiteId, AllocationSiteRegistry, PretenuringFeedbackMap};
use crate::roots::{RootId, Roots};
use crate::scope::ScopeCounters;
use crate::space::{
    AllocationAlignment, AllocationResult, AllocationSpace, LargeObjectSpace, PagedSpace,
    RawAllocation, Space, SpaceResult, YoungSpace,
};

/// Whether a collection is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GcState {
    /// The mutator owns the heap.
    #[default]
    NotInGc,
    /// A collector is between [`Heap::begin_collection`] and
    /// [`Heap::end_collection`].
    InGc,
}

/// A generational heap.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) arena: PageArena,
    pub(crate) young: YoungSpace,
    pub(crate) old: PagedSpace,
    pub(crate) code: PagedSpace,
    pub(crate) descriptors: PagedSpace,
    pub(crate) large_objects: LargeObjectSpace,
    pub(crate) roots: Roots,
    pub(crate) gc_state: GcState,
    pub(crate) scopes: ScopeCounters,
    /// Allocations left before stress mode injects a retry.
    pub(crate) allocation_timeout: usize,
    pub(crate) young_allocation_counter: usize,
    pub(crate) collections: u64,
    pub(crate) store_buffer: StoreBuffer,
    pub(crate) allocation_sites: AllocationSiteRegistry,
    pub(crate) global_pretenuring_feedback: PretenuringFeedbackMap,
    pub(crate) external_string_table: ExternalStringTable,
    pub(crate) external_resources: ExternalResourceRegistry,
    pub(crate) observers: Observers,
    pub(crate) tracker: AllocationTracker,
    pub(crate) created_at: Instant,
}

impl Heap {
    /// Maps the young generation and creates the root objects.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an inconsistent configuration, or the OS
    /// error if the initial pages cannot be mapped.
    pub fn new(config: HeapConfig) -> io::Result<Self> {
        config.validate()?;

        let mut arena = PageArena::new();
        let young = YoungSpace::new(&mut arena, config.page_size, config.young_generation_pages)?;
        let page_size = config.page_size;
        let page_limit = config.paged_space_page_limit;

        let mut heap = Self {
            arena,
            young,
            old: PagedSpace::new(AllocationSpace::Old, page_size, page_limit, false),
            code: PagedSpace::new(AllocationSpace::Code, page_size, page_limit, true),
            descriptors: PagedSpace::new(AllocationSpace::Descriptor, page_size, page_limit, false),
            large_objects: LargeObjectSpace::new(config.large_object_space_limit),
            roots: Roots::new(),
            gc_state: GcState::NotInGc,
            scopes: ScopeCounters::default(),
            allocation_timeout: config.gc_interval.unwrap_or(0),
            young_allocation_counter: 0,
            collections: 0,
            store_buffer: StoreBuffer::default(),
            allocation_sites: AllocationSiteRegistry::default(),
            global_pretenuring_feedback: PretenuringFeedbackMap::default(),
            external_string_table: ExternalStringTable::default(),
            external_resources: ExternalResourceRegistry::default(),
            observers: Observers::default(),
            tracker: AllocationTracker::default(),
            created_at: Instant::now(),
            config,
        };
        heap.create_initial_objects()?;

        #[cfg(feature = "tracing")]
        crate::tracing::log_heap_setup(&heap.config);

        Ok(heap)
    }

    /// Creates the descriptors and shared objects the root table names. These
    /// allocations bypass instrumentation so the allocation hash only covers
    /// mutator activity.
    fn create_initial_objects(&mut self) -> io::Result<()> {
        let meta = self.bootstrap_descriptor_slot()?;
        self.write_descriptor(meta, meta, InstanceKind::Meta, layout::DESCRIPTOR_SIZE);
        self.roots.set(RootId::MetaDescriptor, meta);

        let builtin = [
            (RootId::FillerDescriptor, InstanceKind::Filler, layout::FILLER_SIZE),
            (RootId::FixedArrayDescriptor, InstanceKind::FixedArray, 0),
            (
                RootId::AllocationMementoDescriptor,
                InstanceKind::AllocationMemento,
                layout::MEMENTO_SIZE,
            ),
            (
                RootId::ExternalStringDescriptor,
                InstanceKind::ExternalString,
                layout::EXTERNAL_STRING_SIZE,
            ),
            (
                RootId::SharedFunctionInfoDescriptor,
                InstanceKind::SharedFunctionInfo,
                layout::SHARED_FUNCTION_INFO_SIZE,
            ),
            (RootId::CodeDescriptor, InstanceKind::Code, 0),
            (RootId::JsArrayDescriptor, InstanceKind::JsArray, layout::JS_ARRAY_SIZE),
        ];
        for (root, kind, instance_size) in builtin {
            let descriptor = self.bootstrap_descriptor_slot()?;
            self.write_descriptor(descriptor, meta, kind, instance_size);
            self.roots.set(root, descriptor);
        }

        let empty = self
            .old
            .allocate_raw_unaligned(&mut self.arena, layout::fixed_array_size_for(0))
            .map_err(bootstrap_error)?
            .object;
        let fixed_array = self.roots.fixed_array_descriptor();
        self.write_word(empty, fixed_array.to_word());
        self.write_word(
            empty.offset(layout::FIXED_ARRAY_LENGTH_OFFSET),
            Object::Smi(0).to_word(),
        );
        self.roots.set(RootId::EmptyFixedArray, empty);
        Ok(())
    }

    fn bootstrap_descriptor_slot(&mut self) -> io::Result<Address> {
        self.descriptors
            .allocate_raw_unaligned(&mut self.arena, layout::DESCRIPTOR_SIZE)
            .map(|raw| raw.object)
            .map_err(bootstrap_error)
    }

    fn write_descriptor(
        &mut self,
        descriptor: Address,
        meta: Address,
        kind: InstanceKind,
        instance_size: usize,
    ) {
        self.write_word(descriptor, Object::Heap(meta).to_word());
        self.write_word(descriptor.offset(layout::DESCRIPTOR_KIND_OFFSET), kind as u64);
        self.write_word(
            descriptor.offset(layout::DESCRIPTOR_INSTANCE_SIZE_OFFSET),
            instance_size as u64,
        );
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Root table.
    #[must_use]
    pub const fn roots(&self) -> &Roots {
        &self.roots
    }

    /// Whether a collection is running.
    #[must_use]
    pub const fn gc_state(&self) -> GcState {
        self.gc_state
    }

    /// Number of collections started so far.
    #[must_use]
    pub const fn collections(&self) -> u64 {
        self.collections
    }

    /// All mapped pages.
    #[must_use]
    pub const fn pages(&self) -> &PageArena {
        &self.arena
    }

    /// Page with the given id.
    #[must_use]
    pub fn page(&self, id: PageId) -> &Page {
        self.arena.page(id)
    }

    /// Page whose area contains `address`.
    #[must_use]
    pub fn page_of(&self, address: Address) -> Option<&Page> {
        self.arena.page_of(address)
    }

    /// The space with the given identity.
    #[must_use]
    pub fn space(&self, space: AllocationSpace) -> &dyn Space {
        match space {
            AllocationSpace::Young => &self.young,
            AllocationSpace::Old => &self.old,
            AllocationSpace::Code => &self.code,
            AllocationSpace::Descriptor => &self.descriptors,
            AllocationSpace::LargeObject => &self.large_objects,
        }
    }

    /// The young generation.
    #[must_use]
    pub const fn young_space(&self) -> &YoungSpace {
        &self.young
    }

    /// Next free address in the young generation.
    #[must_use]
    pub const fn young_space_top(&self) -> Address {
        self.young.top()
    }

    /// Bytes allocated in the young generation over the heap's lifetime.
    #[must_use]
    pub const fn young_allocation_counter(&self) -> usize {
        self.young_allocation_counter + self.young.allocated_since_reset()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates `size` bytes, which must be a positive multiple of the word
    /// size, for an object destined for `space`.
    ///
    /// Requests above the large object threshold are redirected to large
    /// object space. Requests for old space, code space and large object
    /// space may land in a different space than asked for, and a retry then
    /// names the space that actually ran out. Successful allocations are
    /// reported to [`Heap::on_allocation_event`].
    ///
    /// # Panics
    ///
    /// Panics if allocation is disallowed, a collection is running, the size
    /// is invalid, or `space` is [`AllocationSpace::LargeObject`] for a
    /// request below the threshold.
    pub fn allocate_raw(
        &mut self,
        size: usize,
        space: AllocationSpace,
        alignment: AllocationAlignment,
    ) -> AllocationResult {
        assert!(
            self.scopes.handle_allocation_allowed() && self.scopes.heap_allocation_allowed(),
            "allocation of {size} bytes inside a no-allocation scope"
        );
        assert_eq!(
            self.gc_state,
            GcState::NotInGc,
            "allocation of {size} bytes during a collection"
        );
        assert!(
            size > 0 && size % WORD_SIZE == 0,
            "allocation size {size} is not a positive multiple of {WORD_SIZE}"
        );

        if self.config.gc_interval.is_some() && !self.scopes.always_allocate() {
            if self.allocation_timeout == 0 {
                return AllocationResult::Retry(space);
            }
            self.allocation_timeout -= 1;
        }

        let large_object = size > self.config.large_object_threshold;
        let outcome = if space == AllocationSpace::Young {
            if large_object {
                self.large_objects.allocate_raw(&mut self.arena, size, false)
            } else {
                self.young.allocate_raw(&self.arena, size, alignment)
            }
        } else {
            self.allocate_raw_outside_young(size, space, alignment, large_object)
        };

        match outcome {
            Ok(raw) => {
                let object = self.place_fillers(raw);
                self.on_allocation_event(object, size);
                AllocationResult::Success(object)
            }
            Err(retry) => {
                #[cfg(feature = "tracing")]
                crate::tracing::log_allocation_retry(space, retry, size);
                AllocationResult::Retry(retry)
            }
        }
    }

    fn allocate_raw_outside_young(
        &mut self,
        size: usize,
        space: AllocationSpace,
        alignment: AllocationAlignment,
        large_object: bool,
    ) -> SpaceResult {
        match space {
            AllocationSpace::Old => {
                if large_object {
                    self.large_objects.allocate_raw(&mut self.arena, size, false)
                } else {
                    self.old.allocate_raw(&mut self.arena, size, alignment)
                }
            }
            AllocationSpace::Code => {
                if size <= self.code.area_size() {
                    self.code.allocate_raw_unaligned(&mut self.arena, size)
                } else {
                    self.large_objects.allocate_raw(&mut self.arena, size, true)
                }
            }
            AllocationSpace::LargeObject => {
                assert!(
                    large_object,
                    "{size} bytes is below the large object threshold"
                );
                self.large_objects.allocate_raw(&mut self.arena, size, false)
            }
            AllocationSpace::Descriptor => {
                self.descriptors.allocate_raw_unaligned(&mut self.arena, size)
            }
            AllocationSpace::Young => unreachable!("young allocations are dispatched earlier"),
        }
    }

    /// Covers the page tail retired by this allocation and any alignment
    /// gap before the object with fillers. A retired tail still holds bytes
    /// from the previous cycle, and a stale memento there would otherwise be
    /// found behind the last object of the page. Alignment gaps only occur
    /// when double alignment exceeds the word size.
    fn place_fillers(&mut self, raw: RawAllocation) -> Address {
        if let Some(tail) = raw.retired {
            self.create_filler_at(tail.top(), tail.limit().offset_from(tail.top()));
        }
        if raw.fill > 0 {
            self.create_filler_at(Address::new(raw.object.raw() - raw.fill), raw.fill);
        }
        raw.object
    }

    /// Writes one-word fillers over `[start, start + size)`.
    fn create_filler_at(&mut self, start: Address, size: usize) {
        let descriptor = self.roots.filler_descriptor().to_word();
        for word in (0..size).step_by(WORD_SIZE) {
            self.write_word(start.offset(word), descriptor);
        }
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Allocates and initializes a type descriptor in descriptor space.
    ///
    /// `instance_size` must be 0 for variable-size kinds and a positive word
    /// multiple otherwise.
    pub fn allocate_descriptor(&mut self, kind: InstanceKind, instance_size: usize) -> AllocationResult {
        assert_eq!(
            kind.is_variable_size(),
            instance_size == 0,
            "{kind:?} descriptor with instance size {instance_size}"
        );
        assert!(instance_size % WORD_SIZE == 0);

        let result = self.allocate_raw(
            layout::DESCRIPTOR_SIZE,
            AllocationSpace::Descriptor,
            AllocationAlignment::WordAligned,
        );
        if let AllocationResult::Success(descriptor) = result {
            let meta = self.roots.get(RootId::MetaDescriptor);
            self.write_descriptor(descriptor, meta, kind, instance_size);
        }
        result
    }

    /// Allocates a fixed-size object of type `descriptor` in `space`, with
    /// every field set to `Smi(0)`.
    ///
    /// When `site` is given, the object is young and its kind tracks
    /// allocation sites, an allocation memento referencing `site` is placed
    /// directly after the object.
    pub fn allocate_object(
        &mut self,
        descriptor: Descriptor,
        space: AllocationSpace,
        site: Option<AllocationSiteId>,
    ) -> AllocationResult {
        let kind = descriptor.kind(self);
        assert!(
            !kind.is_variable_size(),
            "{kind:?} objects need a length; use the dedicated factory"
        );
        let size = descriptor.instance_size(self);
        let memento_site = site.filter(|_| {
            space == AllocationSpace::Young
                && kind.can_track_allocation_site()
                && size + layout::MEMENTO_SIZE <= self.config.large_object_threshold
        });
        let total = size + memento_site.map_or(0, |_| layout::MEMENTO_SIZE);

        let result = self.allocate_raw(total, space, AllocationAlignment::WordAligned);
        if let AllocationResult::Success(object) = result {
            self.initialize_object(object, descriptor, size);
            if let Some(site) = memento_site {
                self.initialize_allocation_memento(object.offset(size), site);
            }
        }
        result
    }

    /// Allocates a fixed array of `length` elements, each `Smi(0)`.
    pub fn allocate_fixed_array(&mut self, length: usize, space: AllocationSpace) -> AllocationResult {
        let size = layout::fixed_array_size_for(length);
        let result = self.allocate_raw(size, space, AllocationAlignment::WordAligned);
        if let AllocationResult::Success(array) = result {
            let descriptor = self.roots.fixed_array_descriptor();
            self.initialize_object(array, descriptor, size);
            self.write_word(
                array.offset(layout::FIXED_ARRAY_LENGTH_OFFSET),
                smi_from_usize(length).to_word(),
            );
        }
        result
    }

    /// Allocates a code object with a zeroed body of `body_size` bytes.
    pub fn allocate_code(&mut self, body_size: usize) -> AllocationResult {
        let size = layout::code_size_for(body_size);
        let result = self.allocate_raw(size, AllocationSpace::Code, AllocationAlignment::WordAligned);
        if let AllocationResult::Success(code) = result {
            let descriptor = self.roots.code_descriptor();
            self.write_word(code, descriptor.to_word());
            self.write_word(
                code.offset(layout::CODE_BODY_SIZE_OFFSET),
                smi_from_usize(body_size).to_word(),
            );
            for offset in (layout::CODE_HEADER_SIZE..size).step_by(WORD_SIZE) {
                self.write_word(code.offset(offset), 0);
            }
        }
        result
    }

    fn initialize_object(&mut self, object: Address, descriptor: Descriptor, size: usize) {
        self.write_word(object, descriptor.to_word());
        let zero = Object::Smi(0).to_word();
        for offset in (WORD_SIZE..size).step_by(WORD_SIZE) {
            self.write_word(object.offset(offset), zero);
        }
    }

    // ========================================================================
    // Memory access
    // ========================================================================

    fn page_containing(&self, address: Address) -> &Page {
        self.arena
            .page_of(address)
            .unwrap_or_else(|| panic!("{address} is not inside any heap page"))
    }

    /// Loads the word at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the address is unaligned or outside the heap.
    #[must_use]
    pub fn read_word(&self, address: Address) -> u64 {
        self.page_containing(address).read_word(address)
    }

    /// Stores a raw word without a write barrier. Use
    /// [`Heap::write_field`] for stores that may create old-to-young
    /// references.
    ///
    /// # Panics
    ///
    /// Panics if the address is unaligned or outside the heap.
    pub fn write_word(&mut self, address: Address, word: u64) {
        self.arena
            .page_of_mut(address)
            .unwrap_or_else(|| panic!("{address} is not inside any heap page"))
            .write_word(address, word);
    }

    /// Loads the tagged value at `object + offset`.
    #[must_use]
    pub fn read_field(&self, object: Address, offset: usize) -> Object {
        Object::from_word(self.read_word(object.offset(offset)))
    }

    /// Loads a non-negative small integer field.
    ///
    /// # Panics
    ///
    /// Panics if the field holds a reference or a negative value.
    #[must_use]
    pub fn read_smi(&self, object: Address, offset: usize) -> usize {
        match self.read_field(object, offset) {
            Object::Smi(value) => usize::try_from(value)
                .unwrap_or_else(|_| panic!("negative length {value} in object at {object}")),
            Object::Heap(address) => {
                panic!("expected a small integer at {object}+{offset}, found reference {address}")
            }
        }
    }

    /// Descriptor of the object at `object`.
    ///
    /// # Panics
    ///
    /// Panics if the first word is not a reference.
    #[must_use]
    pub fn descriptor_of(&self, object: Address) -> Descriptor {
        match self.read_field(object, layout::DESCRIPTOR_OFFSET) {
            Object::Heap(descriptor) => Descriptor::from(descriptor),
            Object::Smi(value) => panic!("object at {object} has no descriptor (found Smi {value})"),
        }
    }

    /// Kind of the object at `object`.
    #[must_use]
    pub fn kind_of(&self, object: Address) -> InstanceKind {
        self.descriptor_of(object).kind(self)
    }

    /// Size in bytes of the object at `object`.
    #[must_use]
    pub fn size_of(&self, object: Address) -> usize {
        self.descriptor_of(object).size_of(self, object)
    }

    /// Copies `byte_size` bytes word by word. The ranges may be on different
    /// pages but must not overlap.
    ///
    /// # Panics
    ///
    /// Panics if `byte_size` is not a word multiple or either range leaves
    /// the heap.
    pub fn copy_block(&mut self, destination: Address, source: Address, byte_size: usize) {
        assert!(
            byte_size % WORD_SIZE == 0,
            "block size {byte_size} is not a multiple of {WORD_SIZE}"
        );
        assert!(
            destination.offset(byte_size) <= source || source.offset(byte_size) <= destination,
            "overlapping copy from {source} to {destination}"
        );
        for offset in (0..byte_size).step_by(WORD_SIZE) {
            let word = self.read_word(source.offset(offset));
            self.write_word(destination.offset(offset), word);
        }
    }

    // ========================================================================
    // Generation queries
    // ========================================================================

    /// Whether `object` references an object in the young generation.
    /// Small integers are never young.
    #[must_use]
    pub fn in_young_generation(&self, object: Object) -> bool {
        let young = self.page_flag_of(object, PageFlags::IN_TO_SPACE | PageFlags::IN_FROM_SPACE, true);
        debug_assert!(
            !young || self.gc_state == GcState::InGc || self.in_to_space(object),
            "mutator holds a reference into from-space"
        );
        young
    }

    /// Whether `object` is on a young page being evacuated.
    #[must_use]
    pub fn in_from_space(&self, object: Object) -> bool {
        self.page_flag_of(object, PageFlags::IN_FROM_SPACE, false)
    }

    /// Whether `object` is on a young page receiving allocations.
    #[must_use]
    pub fn in_to_space(&self, object: Object) -> bool {
        self.page_flag_of(object, PageFlags::IN_TO_SPACE, false)
    }

    /// Whether `object` is on an old-space page.
    #[must_use]
    pub fn in_old_space(&self, object: Object) -> bool {
        object
            .heap_address()
            .and_then(|address| self.arena.page_of(address))
            .is_some_and(|page| page.owner() == AllocationSpace::Old)
    }

    /// Whether `address` lies on any page of the heap.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool {
        self.arena.page_of(address).is_some()
    }

    fn page_flag_of(&self, object: Object, flags: PageFlags, any: bool) -> bool {
        object
            .heap_address()
            .and_then(|address| self.arena.page_of(address))
            .is_some_and(|page| {
                if any {
                    page.flags().intersects(flags)
                } else {
                    page.flags().contains(flags)
                }
            })
    }

    /// Whether the young object at `address` already survived one young
    /// collection, i.e. lies below the age mark.
    #[must_use]
    pub fn should_be_promoted(&self, address: Address) -> bool {
        self.young.should_be_promoted(&self.arena, address)
    }

    // ========================================================================
    // Collection lifecycle
    // ========================================================================

    /// Marks the start of a collection. Allocation is forbidden until
    /// [`Heap::end_collection`].
    ///
    /// # Panics
    ///
    /// Panics if a collection is already running.
    pub fn begin_collection(&mut self) {
        assert_eq!(
            self.gc_state,
            GcState::NotInGc,
            "collection started while another is running"
        );
        self.gc_state = GcState::InGc;
        self.collections += 1;

        #[cfg(feature = "tracing")]
        crate::tracing::log_collection_begin(self.collections, self.young_allocation_counter());
    }

    /// Marks the end of a collection and rearms the stress timeout.
    ///
    /// # Panics
    ///
    /// Panics if no collection is running.
    pub fn end_collection(&mut self) {
        assert_eq!(self.gc_state, GcState::InGc, "no collection is running");
        self.gc_state = GcState::NotInGc;
        self.allocation_timeout = self.config.gc_interval.unwrap_or(0);

        #[cfg(feature = "tracing")]
        crate::tracing::log_collection_end(self.collections);
    }

    /// Empties the young generation so allocation restarts at the base of its
    /// first page. Objects left there are garbage from this point on.
    ///
    /// # Panics
    ///
    /// Panics outside a collection.
    pub fn reset_young_generation(&mut self) {
        self.assert_in_gc("reset the young generation");
        self.young_allocation_counter += self.young.allocated_since_reset();
        self.young.reset(&self.arena);
    }

    /// Moves the young-generation age mark.
    ///
    /// # Panics
    ///
    /// Panics outside a collection or if `mark` is not in the young
    /// generation.
    pub fn set_young_age_mark(&mut self, mark: Address) {
        self.assert_in_gc("move the age mark");
        self.young.set_age_mark(&mut self.arena, mark);
    }

    /// Sets generation-transition flags on the page containing `address`.
    ///
    /// # Panics
    ///
    /// Panics if `flags` includes bits fixed at page creation or the address
    /// is outside the heap.
    pub fn set_page_flag(&mut self, address: Address, flags: PageFlags) {
        self.transition_page(address, flags).set_flags(flags);
    }

    /// Clears generation-transition flags on the page containing `address`.
    ///
    /// # Panics
    ///
    /// As [`Heap::set_page_flag`].
    pub fn clear_page_flag(&mut self, address: Address, flags: PageFlags) {
        self.transition_page(address, flags).clear_flags(flags);
    }

    fn transition_page(&mut self, address: Address, flags: PageFlags) -> &mut Page {
        assert!(
            PageFlags::GENERATION_TRANSITIONS.contains(flags),
            "{flags:?} cannot change after a page is created"
        );
        self.arena
            .page_of_mut(address)
            .unwrap_or_else(|| panic!("{address} is not inside any heap page"))
    }

    pub(crate) fn assert_in_gc(&self, what: &str) {
        assert_eq!(self.gc_state, GcState::InGc, "cannot {what} outside a collection");
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Table entries may point at reclaimed memory if the collector did not
        // clean them up, so release through the registry instead.
        self.external_resources.dispose_all();
    }
}

fn bootstrap_error(space: AllocationSpace) -> io::Error {
    io::Error::new(
        io::ErrorKind::OutOfMemory,
        format!("{space} space exhausted while creating initial objects"),
    )
}

pub(crate) fn smi_from_usize(value: usize) -> Object {
    Object::Smi(i64::try_from(value).unwrap_or_else(|_| panic!("{value} does not fit in a Smi")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(HeapConfig {
            page_size: 4096,
            large_object_threshold: 2048,
            young_generation_pages: 2,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn roots_are_initialized_outside_the_young_generation() {
        let heap = small_heap();
        for (id, address) in heap.roots().iter() {
            assert!(!address.is_null(), "{} not set", id.name());
            assert!(!heap.in_young_generation(Object::Heap(address)));
        }
        let meta = heap.roots().meta_descriptor();
        assert_eq!(heap.descriptor_of(meta.address()), meta);
        assert_eq!(meta.kind(&heap), InstanceKind::Meta);
        assert_eq!(heap.kind_of(heap.roots().empty_fixed_array()), InstanceKind::FixedArray);
    }

    #[test]
    fn bootstrap_does_not_touch_the_allocation_hash() {
        let heap = small_heap();
        assert_eq!(heap.allocations_count(), 0);
        assert_eq!(heap.raw_allocations_hash(), 0);
    }

    #[test]
    fn fixed_arrays_report_their_size() {
        let mut heap = small_heap();
        let array = heap
            .allocate_fixed_array(5, AllocationSpace::Young)
            .to_object_checked();
        assert_eq!(heap.size_of(array), layout::fixed_array_size_for(5));
        assert_eq!(heap.read_smi(array, layout::FIXED_ARRAY_LENGTH_OFFSET), 5);
    }

    #[test]
    fn young_allocation_counter_survives_resets() {
        let mut heap = small_heap();
        let _ = heap.allocate_raw(64, AllocationSpace::Young, AllocationAlignment::WordAligned);
        heap.begin_collection();
        heap.reset_young_generation();
        heap.end_collection();
        let _ = heap.allocate_raw(32, AllocationSpace::Young, AllocationAlignment::WordAligned);
        assert_eq!(heap.young_allocation_counter(), 96);
    }

    #[test]
    #[should_panic(expected = "cannot change after a page is created")]
    fn executable_flag_is_fixed() {
        let mut heap = small_heap();
        let top = heap.young_space_top();
        heap.set_page_flag(top, PageFlags::EXECUTABLE);
    }

    #[test]
    fn copy_block_moves_words_between_pages() {
        let mut heap = small_heap();
        let source = heap
            .allocate_fixed_array(2, AllocationSpace::Old)
            .to_object_checked();
        heap.write_word(source.offset(16), Object::Smi(7).to_word());
        let target = heap
            .allocate_raw(32, AllocationSpace::Young, AllocationAlignment::WordAligned)
            .to_object_checked();

        heap.copy_block(target, source, 32);

        assert_eq!(heap.read_field(target, 16), Object::Smi(7));
        assert_eq!(heap.size_of(target), 32);
    }
}
