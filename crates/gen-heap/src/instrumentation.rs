//! Allocation and move instrumentation.
//!
//! Every successful allocation and every object relocation reported by the
//! collector passes through [`Heap::on_allocation_event`] or
//! [`Heap::on_move_event`]. They forward to the installed [`Observers`] and,
//! in deterministic mode, fold the event into a rolling hash. Two runs of
//! the same program produce the same sequence of digests exactly when they
//! allocate and move the same objects in the same order, which makes the
//! digests a cheap replay check.
//!
//! Addresses are hashed relative to their page, tagged with the owning
//! space, so the digests do not depend on where the OS mapped the pages.

use std::fmt;
use std::sync::Arc;

use crate::heap::Heap;
use crate::objects::{Address, InstanceKind};

/// Low 30 bits of a finalized hash; a zero here is replaced by
/// [`ZERO_HASH`].
pub const HASH_BIT_MASK: u32 = 0x3FFF_FFFF;

/// Bits or'ed into a finalized hash whose masked value is zero.
pub const ZERO_HASH: u32 = 27;

/// Receives allocation and move events, e.g. a heap profiler building an
/// allocation timeline.
pub trait HeapProfiler: Send + Sync {
    /// Whether [`HeapProfiler::allocation_event`] should be called.
    fn is_tracking_allocations(&self) -> bool;

    /// `size` bytes were allocated at `address`.
    fn allocation_event(&self, address: Address, size: usize);

    /// Whether [`HeapProfiler::object_move_event`] should be called.
    fn is_tracking_object_moves(&self) -> bool;

    /// An object of `size` bytes moved from `from` to `to`.
    fn object_move_event(&self, from: Address, to: Address, size: usize);
}

/// Receives code-related events.
pub trait CodeEventLogger: Send + Sync {
    /// A shared function info moved.
    fn shared_function_info_move_event(&self, from: Address, to: Address);
}

/// Prints a short stack trace on request.
pub trait StackTracer: Send + Sync {
    /// Emit a concise trace of the current mutator stack.
    fn print_concise_stack(&self);
}

/// Collaborators notified by the instrumentation hooks.
#[derive(Clone, Default)]
pub struct Observers {
    /// Allocation and move listener.
    pub profiler: Option<Arc<dyn HeapProfiler>>,
    /// Code event listener.
    pub code_logger: Option<Arc<dyn CodeEventLogger>>,
    /// Stack sampler used when a sampling interval is configured.
    pub stack_tracer: Option<Arc<dyn StackTracer>>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("profiler", &self.profiler.is_some())
            .field("code_logger", &self.code_logger.is_some())
            .field("stack_tracer", &self.stack_tracer.is_some())
            .finish()
    }
}

/// Snapshot taken every `digest_interval` events in deterministic mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationDigest {
    /// Event count when the digest was taken.
    pub allocations: u64,
    /// Finalized rolling hash.
    pub hash: u32,
}

/// Clock advanced by one tick per time request, so timestamps are a pure
/// function of the event sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyntheticClock {
    ticks: u64,
}

impl SyntheticClock {
    /// Milliseconds per tick.
    pub const TICK_MS: f64 = 1.0;

    /// Advances the clock and returns the new time.
    #[allow(clippy::cast_precision_loss)]
    pub fn now_ms(&mut self) -> f64 {
        self.ticks += 1;
        self.ticks as f64 * Self::TICK_MS
    }

    /// Requests served so far.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[derive(Debug, Default)]
pub(crate) struct AllocationTracker {
    pub allocations_count: u64,
    pub raw_hash: u32,
    pub clock: SyntheticClock,
    pub digests: Vec<AllocationDigest>,
    pub stack_samples: u64,
}

/// One step of the rolling string hash.
#[must_use]
pub const fn add_character_core(running_hash: u32, c: u16) -> u32 {
    let mut hash = running_hash.wrapping_add(c as u32);
    hash = hash.wrapping_add(hash << 10);
    hash ^ (hash >> 6)
}

/// Final avalanche of the rolling hash.
#[must_use]
pub const fn get_hash_core(running_hash: u32) -> u32 {
    let mut hash = running_hash;
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    if hash & HASH_BIT_MASK == 0 {
        hash | ZERO_HASH
    } else {
        hash
    }
}

impl Heap {
    /// Installs the collaborators notified by the hooks.
    pub fn set_observers(&mut self, observers: Observers) {
        self.observers = observers;
    }

    /// Installed collaborators.
    #[must_use]
    pub const fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Reports a successful allocation. Called by [`Heap::allocate_raw`].
    pub fn on_allocation_event(&mut self, object: Address, size: usize) {
        if let Some(profiler) = &self.observers.profiler {
            if profiler.is_tracking_allocations() {
                profiler.allocation_event(object, size);
            }
        }

        let deterministic = self.config.enable_deterministic_hash;
        if deterministic {
            self.tracker.allocations_count += 1;
            self.monotonically_increasing_time_ms();
            self.update_allocations_hash_for(object);
            self.update_allocations_hash(size_as_hash_value(size));
            self.maybe_record_allocation_digest();
        }

        let interval = self.config.stack_sample_interval;
        if interval > 0 {
            if !deterministic {
                self.tracker.allocations_count += 1;
            }
            if self.tracker.allocations_count % interval == 0 {
                self.sample_stack();
            }
        }
    }

    /// Reports that the collector moved an object of `size` bytes from
    /// `source` to `target`. The object at `target` must already be copied.
    pub fn on_move_event(&mut self, target: Address, source: Address, size: usize) {
        if let Some(profiler) = &self.observers.profiler {
            if profiler.is_tracking_object_moves() {
                profiler.object_move_event(source, target, size);
            }
        }
        if self.kind_of(target) == InstanceKind::SharedFunctionInfo {
            if let Some(logger) = &self.observers.code_logger {
                logger.shared_function_info_move_event(source, target);
            }
        }

        if self.config.enable_deterministic_hash {
            self.tracker.allocations_count += 1;
            self.monotonically_increasing_time_ms();
            self.update_allocations_hash_for(source);
            self.update_allocations_hash_for(target);
            self.update_allocations_hash(size_as_hash_value(size));
            self.maybe_record_allocation_digest();
        }
    }

    /// Milliseconds since the heap was created. In deterministic mode this
    /// is the synthetic clock, which advances one tick per call.
    pub fn monotonically_increasing_time_ms(&mut self) -> f64 {
        if self.config.enable_deterministic_hash {
            self.tracker.clock.now_ms()
        } else {
            self.created_at.elapsed().as_secs_f64() * 1000.0
        }
    }

    /// Events counted so far.
    #[must_use]
    pub const fn allocations_count(&self) -> u64 {
        self.tracker.allocations_count
    }

    /// Rolling hash before finalization.
    #[must_use]
    pub const fn raw_allocations_hash(&self) -> u32 {
        self.tracker.raw_hash
    }

    /// Finalized hash of everything folded in so far.
    #[must_use]
    pub const fn allocations_digest(&self) -> u32 {
        get_hash_core(self.tracker.raw_hash)
    }

    /// Digests recorded at every multiple of the digest interval.
    #[must_use]
    pub fn allocation_digests(&self) -> &[AllocationDigest] {
        &self.tracker.digests
    }

    /// Stack samples requested so far.
    #[must_use]
    pub const fn stack_samples(&self) -> u64 {
        self.tracker.stack_samples
    }

    /// Folds the page-relative position of `object` and the identity of its
    /// space into the hash.
    #[allow(clippy::cast_possible_truncation)]
    fn update_allocations_hash_for(&mut self, object: Address) {
        let page = self
            .page_of(object)
            .unwrap_or_else(|| panic!("instrumented object {object} is not in the heap"));
        let offset = page.offset_of(object) as u32;
        let value = offset | (page.owner().tag() << self.config.page_size_bits());
        self.update_allocations_hash(value);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn update_allocations_hash(&mut self, value: u32) {
        let low = value as u16;
        let high = (value >> 16) as u16;
        let hash = add_character_core(self.tracker.raw_hash, low);
        self.tracker.raw_hash = add_character_core(hash, high);
    }

    fn maybe_record_allocation_digest(&mut self) {
        if self.tracker.allocations_count % self.config.digest_interval == 0 {
            self.record_allocation_digest();
        }
    }

    fn record_allocation_digest(&mut self) {
        let digest = AllocationDigest {
            allocations: self.tracker.allocations_count,
            hash: self.allocations_digest(),
        };

        #[cfg(feature = "tracing")]
        crate::tracing::log_allocation_digest(digest.allocations, digest.hash);

        self.tracker.digests.push(digest);
    }

    fn sample_stack(&mut self) {
        self.tracker.stack_samples += 1;

        #[cfg(feature = "tracing")]
        crate::tracing::log_stack_sample(self.tracker.allocations_count);

        if let Some(tracer) = &self.observers.stack_tracer {
            tracer.print_concise_stack();
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn size_as_hash_value(size: usize) -> u32 {
    size as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_step_matches_reference_values() {
        // 1 + (1 << 10) = 1025, 1025 ^ (1025 >> 6) = 1025 ^ 16 = 1041
        assert_eq!(add_character_core(0, 1), 1041);
        assert_eq!(add_character_core(0, 0), 0);
    }

    #[test]
    fn zero_hash_is_replaced() {
        assert_eq!(get_hash_core(0), ZERO_HASH);
        assert_ne!(get_hash_core(1041) & HASH_BIT_MASK, 0);
    }

    #[test]
    fn synthetic_clock_ticks_per_request() {
        let mut clock = SyntheticClock::default();
        assert!((clock.now_ms() - 1.0).abs() < f64::EPSILON);
        assert!((clock.now_ms() - 2.0).abs() < f64::EPSILON);
        assert_eq!(clock.ticks(), 2);
    }
}
