//! Scoped allocation guards.
//!
//! Each guard increments a counter owned by the heap while alive. Guards nest
//! and may be held across calls that take `&mut Heap`, because they share the
//! counter rather than borrowing the heap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::heap::Heap;

#[derive(Debug, Default)]
pub(crate) struct ScopeCounters {
    disallow_heap_allocation: Arc<AtomicUsize>,
    disallow_handle_allocation: Arc<AtomicUsize>,
    always_allocate: Arc<AtomicUsize>,
}

impl ScopeCounters {
    pub(crate) fn heap_allocation_allowed(&self) -> bool {
        self.disallow_heap_allocation.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn handle_allocation_allowed(&self) -> bool {
        self.disallow_handle_allocation.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn always_allocate(&self) -> bool {
        self.always_allocate.load(Ordering::Relaxed) > 0
    }
}

macro_rules! counted_scope {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[must_use = "the scope ends as soon as the guard is dropped"]
        #[derive(Debug)]
        pub struct $name {
            counter: Arc<AtomicUsize>,
        }

        impl $name {
            fn enter(counter: &Arc<AtomicUsize>) -> Self {
                counter.fetch_add(1, Ordering::Relaxed);
                Self {
                    counter: Arc::clone(counter),
                }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.counter.fetch_sub(1, Ordering::Relaxed);
            }
        }
    };
}

counted_scope!(
    /// While alive, any heap allocation is a fatal error.
    DisallowHeapAllocation
);

counted_scope!(
    /// While alive, any heap allocation is a fatal error. Embedders use it to
    /// guard code that must not create handles.
    DisallowHandleAllocation
);

counted_scope!(
    /// While alive, stress-mode allocation failures are suppressed.
    AlwaysAllocateScope
);

impl Heap {
    /// Forbids allocation until the guard is dropped.
    pub fn disallow_heap_allocation(&self) -> DisallowHeapAllocation {
        DisallowHeapAllocation::enter(&self.scopes.disallow_heap_allocation)
    }

    /// Forbids handle creation, and with it allocation, until the guard is
    /// dropped.
    pub fn disallow_handle_allocation(&self) -> DisallowHandleAllocation {
        DisallowHandleAllocation::enter(&self.scopes.disallow_handle_allocation)
    }

    /// Suppresses injected allocation failures until the guard is dropped.
    pub fn always_allocate_scope(&self) -> AlwaysAllocateScope {
        AlwaysAllocateScope::enter(&self.scopes.always_allocate)
    }

    /// Whether an [`AlwaysAllocateScope`] is active.
    #[must_use]
    pub fn always_allocate(&self) -> bool {
        self.scopes.always_allocate()
    }
}
