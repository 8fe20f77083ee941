//! Allocation core of a generational, moving garbage-collected heap.
//!
//! `gen-heap` owns the parts of a managed-language heap that sit on every
//! object-creation and pointer-store path. The collector itself is external:
//! it drives the heap through [`Heap::begin_collection`],
//! [`Heap::on_move_event`], [`Heap::reset_young_generation`] and friends.
//!
//! # Features
//!
//! - **Allocation dispatcher**: [`Heap::allocate_raw`] picks the young, old,
//!   code, descriptor or large object space and reports
//!   [`AllocationResult::Retry`] when a collection must run first
//! - **Write barrier**: old-to-young stores are recorded in the
//!   [`StoreBuffer`] so a young collection never scans the old generation
//! - **Pretenuring**: allocation mementos feed per-site survival statistics
//!   that move long-lived allocation sites to old space
//! - **Deterministic replay**: allocations and moves are folded into a
//!   rolling hash whose digests are identical across runs
//!
//! # Quick Start
//!
//! ```
//! use gen_heap::{AllocationSpace, Heap, HeapConfig, Object};
//!
//! let mut heap = Heap::new(HeapConfig::default()).unwrap();
//!
//! let holder = heap
//!     .allocate_fixed_array(4, AllocationSpace::Old)
//!     .to_object_checked();
//! let young = heap
//!     .allocate_fixed_array(1, AllocationSpace::Young)
//!     .to_object_checked();
//!
//! // An old array now references a young one: the slot is remembered.
//! heap.fixed_array_set(holder, 0, Object::Heap(young));
//! assert_eq!(heap.store_buffer().len(), 1);
//! ```
//!
//! # Retrying allocations
//!
//! ```
//! use gen_heap::{AllocationAlignment, AllocationResult, AllocationSpace, Heap, HeapConfig};
//!
//! let mut heap = Heap::new(HeapConfig {
//!     page_size: 4096,
//!     large_object_threshold: 2048,
//!     young_generation_pages: 1,
//!     ..HeapConfig::default()
//! })
//! .unwrap();
//!
//! loop {
//!     match heap.allocate_raw(1024, AllocationSpace::Young, AllocationAlignment::WordAligned) {
//!         AllocationResult::Success(_) => {}
//!         AllocationResult::Retry(space) => {
//!             assert_eq!(space, AllocationSpace::Young);
//!             break;
//!         }
//!     }
//! }
//!
//! heap.begin_collection();
//! heap.reset_young_generation();
//! heap.end_collection();
//! assert!(!heap
//!     .allocate_raw(1024, AllocationSpace::Young, AllocationAlignment::WordAligned)
//!     .is_retry());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod barrier;
mod config;
mod external_strings;
mod heap;
mod instrumentation;
mod objects;
mod page;
mod pretenuring;
mod roots;
mod scope;
mod space;
#[cfg(feature = "tracing")]
mod tracing;

pub use barrier::{RelocInfo, RelocMode, StoreBuffer, TypedSlot};
pub use config::{HeapConfig, MIN_PAGE_SIZE, SPACE_TAG_BITS};
pub use external_strings::{ExternalStringResource, ExternalStringTable};
pub use heap::{GcState, Heap};
pub use instrumentation::{
    add_character_core, get_hash_core, AllocationDigest, CodeEventLogger, HeapProfiler,
    Observers, StackTracer, SyntheticClock, HASH_BIT_MASK, ZERO_HASH,
};
pub use objects::{layout, Address, Descriptor, InstanceKind, Object, DOUBLE_ALIGNMENT, WORD_SIZE};
pub use page::{Page, PageArena, PageFlags, PageId};
pub use pretenuring::{
    AllocationMemento, AllocationSite, AllocationSiteId, AllocationSiteRegistry,
    FindMementoMode, PretenureDecision, PretenuringFeedbackMap, PRETENURE_MINIMUM_CREATED,
    PRETENURE_RATIO,
};
pub use roots::{RootId, Roots};
pub use scope::{AlwaysAllocateScope, DisallowHandleAllocation, DisallowHeapAllocation};
pub use space::{
    fill_to_align, AllocationAlignment, AllocationResult, AllocationSpace, LargeObjectSpace,
    LinearAllocationArea, PagedSpace, Space, YoungSpace,
};
