//! Allocation spaces and their bump-pointer allocators.

use std::fmt;

use crate::objects::{Address, DOUBLE_ALIGNMENT, WORD_SIZE};
use crate::page::{PageArena, PageFlags, PageId};

/// Identity of a space. The discriminant is the tag folded into allocation
/// hash values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AllocationSpace {
    /// Short-lived objects, evacuated by the young-generation collector.
    Young = 0,
    /// Survivors and pretenured objects.
    Old = 1,
    /// Executable code objects.
    Code = 2,
    /// Type descriptors.
    Descriptor = 3,
    /// Objects above the large object threshold, one page each.
    LargeObject = 4,
}

impl AllocationSpace {
    /// Every space, in tag order.
    pub const ALL: [Self; 5] = [
        Self::Young,
        Self::Old,
        Self::Code,
        Self::Descriptor,
        Self::LargeObject,
    ];

    /// Tag of the space in allocation hash values.
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Young => "young",
            Self::Old => "old",
            Self::Code => "code",
            Self::Descriptor => "descriptor",
            Self::LargeObject => "large-object",
        }
    }
}

impl fmt::Display for AllocationSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of an allocation request.
///
/// A retry is not an error: the caller is expected to run a collection of the
/// named space and try again.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationResult {
    /// Fresh memory at the address. The contents are unspecified until the
    /// caller initializes the object.
    Success(Address),
    /// The space named could not satisfy the request.
    Retry(AllocationSpace),
}

impl AllocationResult {
    /// Returns `true` for [`AllocationResult::Retry`].
    #[must_use]
    pub const fn is_retry(self) -> bool {
        matches!(self, Self::Retry(_))
    }

    /// The allocated address, if the request succeeded.
    #[must_use]
    pub const fn to_address(self) -> Option<Address> {
        match self {
            Self::Success(address) => Some(address),
            Self::Retry(_) => None,
        }
    }

    /// The allocated address.
    ///
    /// # Panics
    ///
    /// Panics on a retry.
    pub fn to_object_checked(self) -> Address {
        match self {
            Self::Success(address) => address,
            Self::Retry(space) => panic!("allocation needs a {space} collection first"),
        }
    }

    /// The space to collect before retrying.
    ///
    /// # Panics
    ///
    /// Panics on success.
    pub fn retry_space(self) -> AllocationSpace {
        match self {
            Self::Retry(space) => space,
            Self::Success(address) => panic!("allocation at {address} did not fail"),
        }
    }
}

/// Alignment requested for an allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocationAlignment {
    /// Word alignment, the natural alignment of every object.
    #[default]
    WordAligned,
    /// Alignment suitable for an unboxed double.
    DoubleAligned,
}

impl AllocationAlignment {
    const fn bytes(self) -> usize {
        match self {
            Self::WordAligned => WORD_SIZE,
            Self::DoubleAligned => DOUBLE_ALIGNMENT,
        }
    }
}

/// Bytes of filler needed before `address` to satisfy `alignment`.
#[must_use]
pub const fn fill_to_align(address: Address, alignment: AllocationAlignment) -> usize {
    let align = alignment.bytes();
    (align - address.raw() % align) % align
}

/// Memory handed out by a space, before the heap turns it into an
/// [`AllocationResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RawAllocation {
    pub object: Address,
    /// Filler bytes placed directly before `object`.
    pub fill: usize,
    /// Tail of the previous page, given up to make room for this request.
    /// It still holds whatever the last cycle left there and must be covered
    /// with fillers before anyone looks behind an object.
    pub retired: Option<LinearAllocationArea>,
}

pub(crate) type SpaceResult = Result<RawAllocation, AllocationSpace>;

/// The `[top, limit)` window a space bumps through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinearAllocationArea {
    top: Address,
    limit: Address,
}

impl LinearAllocationArea {
    /// Creates an area spanning `[top, limit)`.
    #[must_use]
    pub const fn new(top: Address, limit: Address) -> Self {
        Self { top, limit }
    }

    /// Next free address.
    #[must_use]
    pub const fn top(&self) -> Address {
        self.top
    }

    /// End of the area.
    #[must_use]
    pub const fn limit(&self) -> Address {
        self.limit
    }

    fn allocate(&mut self, size: usize, alignment: AllocationAlignment) -> Option<RawAllocation> {
        let fill = fill_to_align(self.top, alignment);
        let needed = size + fill;
        if self.limit.raw() - self.top.raw() < needed {
            return None;
        }
        let object = self.top.offset(fill);
        self.top = self.top.offset(needed);
        Some(RawAllocation {
            object,
            fill,
            retired: None,
        })
    }

    /// The unused `[top, limit)` window, if any.
    const fn unused(&self) -> Option<Self> {
        if self.top.raw() < self.limit.raw() {
            Some(*self)
        } else {
            None
        }
    }

}

/// Read-only view shared by every space.
pub trait Space {
    /// Identity of the space.
    fn identity(&self) -> AllocationSpace;

    /// Pages owned by the space, in the order they were added.
    fn pages(&self) -> &[PageId];

    /// Bytes handed out since creation (young space: since the last reset).
    fn size(&self) -> usize;

    /// Whether `address` lies on one of this space's pages.
    fn contains(&self, arena: &PageArena, address: Address) -> bool {
        arena
            .page_of(address)
            .is_some_and(|page| page.owner() == self.identity())
    }
}

// ============================================================================
// Paged spaces: old, code, descriptor
// ============================================================================

/// A space that grows one page at a time up to a page limit.
///
/// When the current page cannot fit a request its tail is retired and the
/// allocation continues on a fresh page. The heap covers retired tails with
/// fillers.
#[derive(Debug)]
pub struct PagedSpace {
    identity: AllocationSpace,
    pages: Vec<PageId>,
    lab: LinearAllocationArea,
    page_size: usize,
    page_limit: usize,
    executable: bool,
    size: usize,
}

impl PagedSpace {
    pub(crate) const fn new(
        identity: AllocationSpace,
        page_size: usize,
        page_limit: usize,
        executable: bool,
    ) -> Self {
        Self {
            identity,
            pages: Vec::new(),
            lab: LinearAllocationArea::new(Address::NULL, Address::NULL),
            page_size,
            page_limit,
            executable,
            size: 0,
        }
    }

    /// Largest object that fits on one page of this space.
    #[must_use]
    pub const fn area_size(&self) -> usize {
        self.page_size
    }

    /// Current linear allocation area.
    #[must_use]
    pub const fn linear_allocation_area(&self) -> LinearAllocationArea {
        self.lab
    }

    pub(crate) fn allocate_raw(
        &mut self,
        arena: &mut PageArena,
        size: usize,
        alignment: AllocationAlignment,
    ) -> SpaceResult {
        assert!(
            size <= self.area_size(),
            "{size} bytes do not fit on a {} page",
            self.identity
        );

        if let Some(raw) = self.lab.allocate(size, alignment) {
            self.size += size + raw.fill;
            return Ok(raw);
        }
        let retired = self.lab.unused();
        if !self.expand(arena) {
            return Err(self.identity);
        }
        let mut raw = self.lab.allocate(size, alignment).ok_or(self.identity)?;
        raw.retired = retired;
        self.size += size + raw.fill;
        Ok(raw)
    }

    pub(crate) fn allocate_raw_unaligned(&mut self, arena: &mut PageArena, size: usize) -> SpaceResult {
        self.allocate_raw(arena, size, AllocationAlignment::WordAligned)
    }

    fn expand(&mut self, arena: &mut PageArena) -> bool {
        if self.pages.len() >= self.page_limit {
            return false;
        }
        let flags = if self.executable {
            PageFlags::EXECUTABLE
        } else {
            PageFlags::empty()
        };
        match arena.allocate_page(self.identity, self.page_size, flags) {
            Ok(id) => {
                let page = arena.page(id);
                self.lab = LinearAllocationArea::new(page.area_start(), page.area_end());
                self.pages.push(id);
                true
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                crate::tracing::log_page_mapping_failed(self.identity, self.page_size, &_err);
                false
            }
        }
    }
}

impl Space for PagedSpace {
    fn identity(&self) -> AllocationSpace {
        self.identity
    }

    fn pages(&self) -> &[PageId] {
        &self.pages
    }

    fn size(&self) -> usize {
        self.size
    }
}

// ============================================================================
// Young space
// ============================================================================

/// The young generation: a fixed set of to-space pages filled in order.
///
/// Allocation moves to the next page when the current one is full, retiring
/// the unused tail, and reports [`AllocationResult::Retry`] once the last
/// page is full. A
/// young-generation collection resets the space back to its first page.
#[derive(Debug)]
pub struct YoungSpace {
    pages: Vec<PageId>,
    current: usize,
    lab: LinearAllocationArea,
    age_mark: Address,
    allocated_since_reset: usize,
}

impl YoungSpace {
    pub(crate) fn new(
        arena: &mut PageArena,
        page_size: usize,
        page_count: usize,
    ) -> std::io::Result<Self> {
        let pages = (0..page_count)
            .map(|_| arena.allocate_page(AllocationSpace::Young, page_size, PageFlags::IN_TO_SPACE))
            .collect::<std::io::Result<Vec<_>>>()?;
        let first = arena.page(pages[0]);
        let lab = LinearAllocationArea::new(first.area_start(), first.area_end());
        Ok(Self {
            age_mark: first.area_start(),
            pages,
            current: 0,
            lab,
            allocated_since_reset: 0,
        })
    }

    /// Next free address.
    #[must_use]
    pub const fn top(&self) -> Address {
        self.lab.top()
    }

    /// End of the current page.
    #[must_use]
    pub const fn limit(&self) -> Address {
        self.lab.limit()
    }

    /// Objects below the age mark survived a young-generation collection.
    #[must_use]
    pub const fn age_mark(&self) -> Address {
        self.age_mark
    }

    /// Page currently being allocated into.
    #[must_use]
    pub fn current_page(&self) -> PageId {
        self.pages[self.current]
    }

    /// Bytes handed out since the last reset.
    #[must_use]
    pub const fn allocated_since_reset(&self) -> usize {
        self.allocated_since_reset
    }

    pub(crate) fn allocate_raw(
        &mut self,
        arena: &PageArena,
        size: usize,
        alignment: AllocationAlignment,
    ) -> SpaceResult {
        let mut retired = None;
        loop {
            if let Some(mut raw) = self.lab.allocate(size, alignment) {
                self.allocated_since_reset += size + raw.fill;
                raw.retired = retired;
                return Ok(raw);
            }
            let tail = self.lab.unused();
            if !self.advance_page(arena) {
                return Err(AllocationSpace::Young);
            }
            retired = retired.or(tail);
        }
    }

    fn advance_page(&mut self, arena: &PageArena) -> bool {
        if self.current + 1 >= self.pages.len() {
            return false;
        }
        self.current += 1;
        let page = arena.page(self.pages[self.current]);
        self.lab = LinearAllocationArea::new(page.area_start(), page.area_end());
        true
    }

    pub(crate) fn reset(&mut self, arena: &PageArena) {
        self.current = 0;
        let first = arena.page(self.pages[0]);
        self.lab = LinearAllocationArea::new(first.area_start(), first.area_end());
        self.allocated_since_reset = 0;
    }

    /// Moves the age mark and flags every page up to and including the one
    /// holding it.
    pub(crate) fn set_age_mark(&mut self, arena: &mut PageArena, mark: Address) {
        assert!(
            self.pages.iter().any(|&id| arena.page(id).contains_limit(mark)),
            "age mark {mark} is not in the young generation"
        );
        self.age_mark = mark;

        let mut below = true;
        for &id in &self.pages {
            let page = arena.page_mut(id);
            if below {
                page.set_flags(PageFlags::NEW_SPACE_BELOW_AGE_MARK);
            } else {
                page.clear_flags(PageFlags::NEW_SPACE_BELOW_AGE_MARK);
            }
            if page.contains_limit(mark) {
                below = false;
            }
        }
    }

    /// Whether the object at `address` has already survived one collection.
    pub(crate) fn should_be_promoted(&self, arena: &PageArena, address: Address) -> bool {
        arena.page_of(address).is_some_and(|page| {
            page.is_flag_set(PageFlags::NEW_SPACE_BELOW_AGE_MARK)
                && (!page.contains_limit(self.age_mark) || address < self.age_mark)
        })
    }
}

impl Space for YoungSpace {
    fn identity(&self) -> AllocationSpace {
        AllocationSpace::Young
    }

    fn pages(&self) -> &[PageId] {
        &self.pages
    }

    fn size(&self) -> usize {
        self.allocated_since_reset
    }
}

// ============================================================================
// Large object space
// ============================================================================

/// One dedicated page per object, bounded by a byte budget.
#[derive(Debug)]
pub struct LargeObjectSpace {
    pages: Vec<PageId>,
    size: usize,
    limit: usize,
}

impl LargeObjectSpace {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            pages: Vec::new(),
            size: 0,
            limit,
        }
    }

    pub(crate) fn allocate_raw(
        &mut self,
        arena: &mut PageArena,
        size: usize,
        executable: bool,
    ) -> SpaceResult {
        if self.size + size > self.limit {
            return Err(AllocationSpace::LargeObject);
        }
        let mut flags = PageFlags::LARGE_PAGE;
        if executable {
            flags |= PageFlags::EXECUTABLE;
        }
        match arena.allocate_page(AllocationSpace::LargeObject, size, flags) {
            Ok(id) => {
                self.pages.push(id);
                self.size += size;
                Ok(RawAllocation {
                    object: arena.page(id).area_start(),
                    fill: 0,
                    retired: None,
                })
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                crate::tracing::log_page_mapping_failed(AllocationSpace::LargeObject, size, &_err);
                Err(AllocationSpace::LargeObject)
            }
        }
    }
}

impl Space for LargeObjectSpace {
    fn identity(&self) -> AllocationSpace {
        AllocationSpace::LargeObject
    }

    fn pages(&self) -> &[PageId] {
        &self.pages
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_aligned_addresses_need_no_fill() {
        let address = Address::new(0x1000);
        assert_eq!(fill_to_align(address, AllocationAlignment::WordAligned), 0);
        assert_eq!(fill_to_align(address, AllocationAlignment::DoubleAligned), 0);
    }

    #[test]
    fn lab_refuses_requests_past_its_limit() {
        let mut lab = LinearAllocationArea::new(Address::new(0x1000), Address::new(0x1020));
        let first = lab.allocate(24, AllocationAlignment::WordAligned).unwrap();
        assert_eq!(first.object, Address::new(0x1000));
        assert!(lab.allocate(16, AllocationAlignment::WordAligned).is_none());
        assert_eq!(lab.top(), Address::new(0x1018));
        let second = lab.allocate(8, AllocationAlignment::WordAligned).unwrap();
        assert_eq!(second.object, Address::new(0x1018));
        assert_eq!(lab.top(), lab.limit());
    }

    #[test]
    fn paged_space_stops_at_its_page_limit() {
        let mut arena = PageArena::new();
        let mut space = PagedSpace::new(AllocationSpace::Old, 4096, 2, false);

        for _ in 0..2 {
            assert!(space.allocate_raw_unaligned(&mut arena, 4096).is_ok());
        }
        assert_eq!(
            space.allocate_raw_unaligned(&mut arena, 8),
            Err(AllocationSpace::Old)
        );
        assert_eq!(space.pages().len(), 2);
        assert_eq!(space.size(), 8192);
    }

    #[test]
    fn young_space_fills_pages_in_order_then_retries() {
        let mut arena = PageArena::new();
        let mut young = YoungSpace::new(&mut arena, 4096, 2).unwrap();
        let second_page = arena.page(young.pages()[1]).area_start();

        assert!(young.allocate_raw(&arena, 4000, AllocationAlignment::WordAligned).is_ok());
        let moved = young
            .allocate_raw(&arena, 200, AllocationAlignment::WordAligned)
            .unwrap();
        assert_eq!(moved.object, second_page);
        assert_eq!(
            young.allocate_raw(&arena, 4000, AllocationAlignment::WordAligned),
            Err(AllocationSpace::Young)
        );

        young.reset(&arena);
        assert_eq!(young.top(), arena.page(young.pages()[0]).area_start());
        assert_eq!(young.allocated_since_reset(), 0);
    }

    #[test]
    fn moving_to_the_next_page_retires_the_tail() {
        let mut arena = PageArena::new();
        let mut young = YoungSpace::new(&mut arena, 4096, 2).unwrap();
        let first_page = arena.page(young.pages()[0]).area_start();

        let first = young
            .allocate_raw(&arena, 4000, AllocationAlignment::WordAligned)
            .unwrap();
        assert_eq!(first.retired, None);
        let moved = young
            .allocate_raw(&arena, 200, AllocationAlignment::WordAligned)
            .unwrap();
        assert_eq!(
            moved.retired,
            Some(LinearAllocationArea::new(
                first_page.offset(4000),
                first_page.offset(4096)
            ))
        );
    }

    #[test]
    fn a_full_page_retires_nothing() {
        let mut arena = PageArena::new();
        let mut space = PagedSpace::new(AllocationSpace::Old, 4096, 2, false);

        let first = space.allocate_raw_unaligned(&mut arena, 4096).unwrap();
        let second = space.allocate_raw_unaligned(&mut arena, 8).unwrap();

        assert_eq!(first.retired, None);
        assert_eq!(second.retired, None);
    }

    #[test]
    fn age_mark_flags_pages_through_the_marked_one() {
        let mut arena = PageArena::new();
        let mut young = YoungSpace::new(&mut arena, 4096, 3).unwrap();
        let pages = young.pages().to_vec();
        let mark = arena.page(pages[1]).area_start().offset(64);

        young.set_age_mark(&mut arena, mark);

        assert!(arena.page(pages[0]).is_flag_set(PageFlags::NEW_SPACE_BELOW_AGE_MARK));
        assert!(arena.page(pages[1]).is_flag_set(PageFlags::NEW_SPACE_BELOW_AGE_MARK));
        assert!(!arena.page(pages[2]).is_flag_set(PageFlags::NEW_SPACE_BELOW_AGE_MARK));

        assert!(young.should_be_promoted(&arena, arena.page(pages[0]).area_start()));
        assert!(young.should_be_promoted(&arena, Address::new(mark.raw() - 8)));
        assert!(!young.should_be_promoted(&arena, mark));
        assert!(!young.should_be_promoted(&arena, arena.page(pages[2]).area_start()));
    }
}
