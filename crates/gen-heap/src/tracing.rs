//! Structured events for heap activity.
//!
//! Only compiled with the `tracing` feature. Call sites are gated with
//! `#[cfg(feature = "tracing")]` so the allocation fast path carries no
//! logging code in default builds.

use std::io;

use tracing::{debug, info, trace, warn};

use crate::config::HeapConfig;
use crate::objects::Address;
use crate::pretenuring::{AllocationSiteId, PretenureDecision};
use crate::space::AllocationSpace;

/// Log heap construction.
pub fn log_heap_setup(config: &HeapConfig) {
    info!(
        page_size = config.page_size,
        young_pages = config.young_generation_pages,
        large_object_threshold = config.large_object_threshold,
        deterministic_hash = config.enable_deterministic_hash,
        pretenuring = config.enable_pretenuring,
        "heap_setup"
    );
}

/// Log an allocation that must be retried after collecting `space`.
pub fn log_allocation_retry(requested: AllocationSpace, retry: AllocationSpace, size: usize) {
    trace!(
        requested = requested.name(),
        retry = retry.name(),
        size,
        "allocation_retry"
    );
}

/// Log a page the OS refused to map after startup.
pub fn log_page_mapping_failed(space: AllocationSpace, size: usize, err: &io::Error) {
    warn!(space = space.name(), size, error = %err, "page_mapping_failed");
}

/// Log a periodic allocation digest.
pub fn log_allocation_digest(allocations: u64, hash: u32) {
    info!(allocations, hash, "allocation_digest");
}

/// Log a stack sample request.
pub fn log_stack_sample(allocations: u64) {
    debug!(allocations, "stack_sample");
}

/// Log the start of a collection.
pub fn log_collection_begin(collection: u64, young_allocation_counter: usize) {
    debug!(collection, young_allocation_counter, "collection_begin");
}

/// Log the end of a collection.
pub fn log_collection_end(collection: u64) {
    debug!(collection, "collection_end");
}

/// Log a site's tenuring decision after feedback processing.
pub fn log_pretenure_decision(site: AllocationSiteId, ratio: f64, decision: PretenureDecision) {
    debug!(site = site.index(), ratio, decision = ?decision, "pretenure_decision");
}

/// Log an external string whose resource was released.
pub fn log_external_string_finalized(string: Address) {
    trace!(string = %string, "external_string_finalized");
}
