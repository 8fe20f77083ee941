//! Pages: mapped regions of memory, each owned by exactly one space.
//!
//! Every page carries a set of [`PageFlags`] that the allocator and the write
//! barrier consult to decide an object's generation without touching the
//! object itself.

use std::collections::BTreeMap;
use std::io;

use bitflags::bitflags;
use sys_alloc::{Mmap, MmapOptions};

use crate::objects::{Address, WORD_SIZE};
use crate::space::AllocationSpace;

bitflags! {
    /// Per-page state bits.
    pub struct PageFlags: u32 {
        /// Page belongs to the half of the young generation receiving new
        /// allocations.
        const IN_TO_SPACE = 1 << 0;
        /// Page belongs to the young half being evacuated.
        const IN_FROM_SPACE = 1 << 1;
        /// Page lies at or below the young-generation age mark.
        const NEW_SPACE_BELOW_AGE_MARK = 1 << 2;
        /// Young page promoted to the old generation as a whole.
        const PAGE_NEW_OLD_PROMOTION = 1 << 3;
        /// Young page moved within the young generation as a whole.
        const PAGE_NEW_NEW_PROMOTION = 1 << 4;
        /// Page memory is executable.
        const EXECUTABLE = 1 << 5;
        /// Page holds a single large object.
        const LARGE_PAGE = 1 << 6;

        /// Flags a collector may set or clear after a page is created.
        const GENERATION_TRANSITIONS = Self::IN_TO_SPACE.bits
            | Self::IN_FROM_SPACE.bits
            | Self::NEW_SPACE_BELOW_AGE_MARK.bits
            | Self::PAGE_NEW_OLD_PROMOTION.bits
            | Self::PAGE_NEW_NEW_PROMOTION.bits;
    }
}

/// Index of a page in its [`PageArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(usize);

impl PageId {
    /// Position of the page in creation order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A contiguous mapped region.
pub struct Page {
    id: PageId,
    owner: AllocationSpace,
    flags: PageFlags,
    memory: Mmap,
}

impl Page {
    /// Identifier of the page.
    #[must_use]
    pub const fn id(&self) -> PageId {
        self.id
    }

    /// Space that owns the page.
    #[must_use]
    pub const fn owner(&self) -> AllocationSpace {
        self.owner
    }

    /// Current flags.
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Returns `true` if every bit in `flag` is set.
    #[must_use]
    pub const fn is_flag_set(&self, flag: PageFlags) -> bool {
        self.flags.contains(flag)
    }

    /// First byte of the page; objects start here.
    #[must_use]
    pub fn area_start(&self) -> Address {
        Address::new(self.memory.ptr() as usize)
    }

    /// One past the last byte of the page.
    #[must_use]
    pub fn area_end(&self) -> Address {
        self.area_start().offset(self.memory.len())
    }

    /// Usable bytes on the page.
    #[must_use]
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// `area_start <= address < area_end`.
    #[must_use]
    pub fn contains(&self, address: Address) -> bool {
        self.memory.contains(address.raw())
    }

    /// `area_start <= address <= area_end`. A linear allocation top that has
    /// reached the end of the page is still "on" the page.
    #[must_use]
    pub fn contains_limit(&self, address: Address) -> bool {
        address >= self.area_start() && address <= self.area_end()
    }

    /// Byte offset of `address` from the start of the page.
    ///
    /// # Panics
    ///
    /// Panics if the address is not on the page.
    #[must_use]
    pub fn offset_of(&self, address: Address) -> usize {
        assert!(
            self.contains_limit(address),
            "{address} is not on page {:?}",
            self.id
        );
        address.offset_from(self.area_start())
    }

    /// Whether the page is part of the young generation.
    #[must_use]
    pub const fn in_young_generation(&self) -> bool {
        self.flags
            .intersects(PageFlags::IN_TO_SPACE.union(PageFlags::IN_FROM_SPACE))
    }

    /// Loads the word at `address`.
    ///
    /// # Panics
    ///
    /// Panics if `address` is unaligned or the word does not lie on the page.
    #[must_use]
    pub fn read_word(&self, address: Address) -> u64 {
        let offset = self.word_offset(address);
        // SAFETY: `word_offset` checked that the aligned word lies inside the
        // mapping, which stays alive as long as `self`.
        unsafe { self.memory.ptr().add(offset).cast::<u64>().read() }
    }

    /// Loads a word that may not belong to any object: memory past the
    /// allocation top, or left over from before the young generation was
    /// reset. Fresh mappings are zero-filled, so the load always observes
    /// either zero or a value an earlier store wrote.
    #[must_use]
    pub fn peek_word(&self, address: Address) -> u64 {
        self.read_word(address)
    }

    /// Stores `word` at `address`.
    ///
    /// # Panics
    ///
    /// Panics if `address` is unaligned or the word does not lie on the page.
    pub fn write_word(&mut self, address: Address, word: u64) {
        let offset = self.word_offset(address);
        // SAFETY: as in `read_word`; `&mut self` rules out concurrent access.
        unsafe { self.memory.ptr().add(offset).cast::<u64>().write(word) }
    }

    pub(crate) fn set_flags(&mut self, flags: PageFlags) {
        self.flags.insert(flags);
    }

    pub(crate) fn clear_flags(&mut self, flags: PageFlags) {
        self.flags.remove(flags);
    }

    fn word_offset(&self, address: Address) -> usize {
        assert!(address.is_word_aligned(), "unaligned word access at {address}");
        let start = self.area_start();
        assert!(
            address >= start && address.offset(WORD_SIZE) <= self.area_end(),
            "word access at {address} outside page [{start}, {})",
            self.area_end()
        );
        address.offset_from(start)
    }
}

/// Owner of every page in a heap.
///
/// Pages are never returned to the operating system while the arena lives,
/// so a [`PageId`] stays valid for the lifetime of the heap.
#[derive(Default)]
pub struct PageArena {
    pages: Vec<Page>,
    by_start: BTreeMap<Address, PageId>,
}

impl PageArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a fresh page of `size` bytes for `owner`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping fails.
    pub(crate) fn allocate_page(
        &mut self,
        owner: AllocationSpace,
        size: usize,
        flags: PageFlags,
    ) -> io::Result<PageId> {
        let memory = MmapOptions::new()
            .len(size)
            .executable(flags.contains(PageFlags::EXECUTABLE))
            // Young pages are bumped through on every cycle.
            .populate(flags.intersects(PageFlags::IN_TO_SPACE | PageFlags::IN_FROM_SPACE))
            .map_anon()?;

        let id = PageId(self.pages.len());
        let page = Page {
            id,
            owner,
            flags,
            memory,
        };
        self.by_start.insert(page.area_start(), id);
        self.pages.push(page);
        Ok(id)
    }

    /// Returns the page with the given id.
    ///
    /// # Panics
    ///
    /// Panics if the id did not come from this arena.
    #[must_use]
    pub fn page(&self, id: PageId) -> &Page {
        &self.pages[id.0]
    }

    pub(crate) fn page_mut(&mut self, id: PageId) -> &mut Page {
        &mut self.pages[id.0]
    }

    /// Page whose area contains `address`.
    #[must_use]
    pub fn page_of(&self, address: Address) -> Option<&Page> {
        let id = self.page_id_of(address)?;
        Some(&self.pages[id.0])
    }

    pub(crate) fn page_of_mut(&mut self, address: Address) -> Option<&mut Page> {
        let id = self.page_id_of(address)?;
        Some(&mut self.pages[id.0])
    }

    fn page_id_of(&self, address: Address) -> Option<PageId> {
        let (_, &id) = self.by_start.range(..=address).next_back()?;
        self.pages[id.0].contains(address).then_some(id)
    }

    /// Number of pages mapped so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` before the first page is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates pages in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_found_by_interior_address() {
        let mut arena = PageArena::new();
        let a = arena
            .allocate_page(AllocationSpace::Old, 4096, PageFlags::empty())
            .unwrap();
        let b = arena
            .allocate_page(AllocationSpace::Young, 4096, PageFlags::IN_TO_SPACE)
            .unwrap();

        let start = arena.page(a).area_start();
        assert_eq!(arena.page_of(start).map(Page::id), Some(a));
        assert_eq!(arena.page_of(start.offset(4088)).map(Page::id), Some(a));

        let young = arena.page(b);
        assert!(young.in_young_generation());
        assert_eq!(young.owner(), AllocationSpace::Young);
        assert_eq!(arena.page_of(young.area_start().offset(8)).map(Page::id), Some(b));
    }

    #[test]
    fn prefaulted_young_pages_start_zeroed() {
        let mut arena = PageArena::new();
        let id = arena
            .allocate_page(AllocationSpace::Young, 8192, PageFlags::IN_TO_SPACE)
            .unwrap();
        let start = arena.page(id).area_start();

        for offset in (0..8192).step_by(4096) {
            assert_eq!(arena.page(id).peek_word(start.offset(offset)), 0);
        }
        arena.page_mut(id).write_word(start.offset(8184), 0x55);
        assert_eq!(arena.page(id).read_word(start.offset(8184)), 0x55);
    }

    #[test]
    fn page_end_is_not_contained_but_is_a_limit() {
        let mut arena = PageArena::new();
        let id = arena
            .allocate_page(AllocationSpace::Old, 4096, PageFlags::empty())
            .unwrap();
        let page = arena.page(id);
        let end = page.area_end();

        assert!(!page.contains(end));
        assert!(page.contains_limit(end));
        assert_eq!(page.offset_of(end), 4096);
    }

    #[test]
    fn words_read_back_and_start_zeroed() {
        let mut arena = PageArena::new();
        let id = arena
            .allocate_page(AllocationSpace::Old, 4096, PageFlags::empty())
            .unwrap();
        let start = arena.page(id).area_start();

        assert_eq!(arena.page(id).peek_word(start.offset(4088)), 0);
        arena.page_mut(id).write_word(start.offset(16), 0xdead_beef);
        assert_eq!(arena.page(id).read_word(start.offset(16)), 0xdead_beef);
    }

    #[test]
    #[should_panic(expected = "outside page")]
    fn last_partial_word_is_rejected() {
        let mut arena = PageArena::new();
        let id = arena
            .allocate_page(AllocationSpace::Old, 4096, PageFlags::empty())
            .unwrap();
        let end = arena.page(id).area_end();
        let _ = arena.page(id).read_word(end);
    }

    #[test]
    fn transitions_exclude_creation_only_flags() {
        assert!(PageFlags::GENERATION_TRANSITIONS.contains(PageFlags::NEW_SPACE_BELOW_AGE_MARK));
        assert!(!PageFlags::GENERATION_TRANSITIONS.contains(PageFlags::EXECUTABLE));
        assert!(!PageFlags::GENERATION_TRANSITIONS.contains(PageFlags::LARGE_PAGE));
    }
}
