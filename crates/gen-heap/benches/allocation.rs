//! Benchmark: allocation fast path, write barrier and allocation hashing
//!
//! Measures young bump allocation with and without mementos, the cost of the
//! deterministic hash on every allocation, and store buffer recording.

use criterion::{criterion_group, criterion_main, Criterion};
use gen_heap::{AllocationAlignment, AllocationSpace, Heap, HeapConfig, Object};
use std::hint::black_box;
use std::time::Duration;

const OBJECTS: usize = 1000;

fn bench_heap(enable_deterministic_hash: bool) -> Heap {
    Heap::new(HeapConfig {
        young_generation_pages: 16,
        enable_deterministic_hash,
        ..HeapConfig::default()
    })
    .unwrap()
}

/// Empties the young generation between iterations.
fn reset(heap: &mut Heap) {
    heap.begin_collection();
    heap.reset_young_generation();
    heap.end_collection();
}

fn bench_young_bump_allocation(c: &mut Criterion) {
    let mut heap = bench_heap(false);
    c.bench_function("young_bump_allocation_1000", |b| {
        b.iter(|| {
            for _ in 0..OBJECTS {
                black_box(heap.allocate_raw(
                    32,
                    AllocationSpace::Young,
                    AllocationAlignment::WordAligned,
                ));
            }
            reset(&mut heap);
        });
    });
}

fn bench_hashed_allocation(c: &mut Criterion) {
    let mut heap = bench_heap(true);
    c.bench_function("young_allocation_with_hash_1000", |b| {
        b.iter(|| {
            for _ in 0..OBJECTS {
                black_box(heap.allocate_raw(
                    32,
                    AllocationSpace::Young,
                    AllocationAlignment::WordAligned,
                ));
            }
            reset(&mut heap);
        });
    });
}

fn bench_memento_allocation(c: &mut Criterion) {
    let mut heap = bench_heap(false);
    let site = heap.create_allocation_site();
    let descriptor = heap.roots().js_array_descriptor();
    c.bench_function("tracked_array_allocation_1000", |b| {
        b.iter(|| {
            for _ in 0..OBJECTS {
                black_box(heap.allocate_object(descriptor, AllocationSpace::Young, Some(site)));
            }
            reset(&mut heap);
        });
    });
}

fn bench_write_barrier(c: &mut Criterion) {
    let mut heap = bench_heap(false);
    let holder = heap
        .allocate_fixed_array(OBJECTS, AllocationSpace::Old)
        .to_object_checked();
    let young = Object::Heap(
        heap.allocate_fixed_array(1, AllocationSpace::Young)
            .to_object_checked(),
    );
    let old = Object::Heap(
        heap.allocate_fixed_array(1, AllocationSpace::Old)
            .to_object_checked(),
    );

    c.bench_function("old_to_old_stores_1000", |b| {
        b.iter(|| {
            for index in 0..OBJECTS {
                heap.fixed_array_set(holder, index, old);
            }
        });
    });
    c.bench_function("old_to_young_stores_1000", |b| {
        b.iter(|| {
            for index in 0..OBJECTS {
                heap.fixed_array_set(holder, index, young);
            }
            black_box(heap.store_buffer_mut().take_entries());
        });
    });
}

criterion_group!(
    name = allocation;
    config = Criterion::default()
        .sample_size(50)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets =
        bench_young_bump_allocation,
        bench_hashed_allocation,
        bench_memento_allocation,
        bench_write_barrier,
);

criterion_main!(allocation);
