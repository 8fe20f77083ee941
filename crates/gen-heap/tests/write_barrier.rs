//! Generational write barrier and store buffer.

use gen_heap::{
    layout, Address, AllocationSpace, Heap, HeapConfig, Object, RelocInfo, RelocMode, TypedSlot,
};
use proptest::prelude::*;

fn small_heap() -> Heap {
    Heap::new(HeapConfig {
        page_size: 4096,
        large_object_threshold: 2048,
        young_generation_pages: 4,
        ..HeapConfig::default()
    })
    .expect("heap setup")
}

fn array(heap: &mut Heap, space: AllocationSpace) -> Address {
    heap.allocate_fixed_array(4, space).to_object_checked()
}

/// Every combination of value generation, container kind and container
/// generation. A slot is recorded only for a young value stored into a
/// non-young heap object.
#[test]
fn record_write_truth_table() {
    for value_young in [false, true] {
        for container_is_heap in [false, true] {
            for container_young in [false, true] {
                let mut heap = small_heap();
                let value = if value_young {
                    Object::Heap(array(&mut heap, AllocationSpace::Young))
                } else {
                    Object::Heap(array(&mut heap, AllocationSpace::Old))
                };
                let holder = if container_young {
                    array(&mut heap, AllocationSpace::Young)
                } else {
                    array(&mut heap, AllocationSpace::Old)
                };
                let container = if container_is_heap {
                    Object::Heap(holder)
                } else {
                    Object::Smi(17)
                };
                let slot = holder.offset(layout::fixed_array_element_offset(0));

                heap.record_write(container, slot, value);

                let expected = value_young && container_is_heap && !container_young;
                let want: Vec<Address> = if expected { vec![slot] } else { Vec::new() };
                assert_eq!(
                    heap.store_buffer().entries(),
                    want.as_slice(),
                    "value_young={value_young} container_is_heap={container_is_heap} \
                     container_young={container_young}"
                );
            }
        }
    }
}

#[test]
fn smi_values_are_never_recorded() {
    let mut heap = small_heap();
    let holder = array(&mut heap, AllocationSpace::Old);
    heap.fixed_array_set(holder, 1, Object::Smi(5));
    assert!(heap.store_buffer().is_empty());
    assert_eq!(heap.fixed_array_get(holder, 1), Object::Smi(5));
}

#[test]
fn large_object_containers_are_old_for_the_barrier() {
    let mut heap = small_heap();
    let big = heap
        .allocate_fixed_array(300, AllocationSpace::Young)
        .to_object_checked();
    assert_eq!(heap.page_of(big).unwrap().owner(), AllocationSpace::LargeObject);
    let young = array(&mut heap, AllocationSpace::Young);

    heap.fixed_array_set(big, 299, Object::Heap(young));

    assert_eq!(
        heap.store_buffer().entries(),
        &[big.offset(layout::fixed_array_element_offset(299))]
    );
}

#[test]
fn code_slots_are_recorded_as_typed_slots() {
    let mut heap = small_heap();
    let code = heap.allocate_code(64).to_object_checked();
    let young = Object::Heap(array(&mut heap, AllocationSpace::Young));
    let old = Object::Heap(array(&mut heap, AllocationSpace::Old));
    let pc = code.offset(layout::CODE_HEADER_SIZE + 8);

    heap.record_write_into_code(code, RelocInfo::new(pc, RelocMode::EmbeddedObject), old);
    assert!(heap.store_buffer().typed_slots().is_empty());

    heap.record_write_into_code(code, RelocInfo::new(pc, RelocMode::EmbeddedObject), young);
    assert_eq!(
        heap.store_buffer().typed_slots(),
        &[TypedSlot {
            host: code,
            slot_type: RelocMode::EmbeddedObject,
            address: pc,
        }]
    );
    assert!(heap.store_buffer().entries().is_empty());
}

#[test]
fn bulk_element_barrier_skips_young_arrays() {
    let mut heap = small_heap();
    let young_array = array(&mut heap, AllocationSpace::Young);
    let young = array(&mut heap, AllocationSpace::Young);
    heap.write_word(
        young_array.offset(layout::fixed_array_element_offset(0)),
        Object::Heap(young).to_word(),
    );

    heap.record_fixed_array_elements(young_array, 0, 4);

    assert!(heap.store_buffer().is_empty());
}

#[test]
fn bulk_element_barrier_covers_only_the_requested_range() {
    let mut heap = small_heap();
    let holder = heap
        .allocate_fixed_array(6, AllocationSpace::Old)
        .to_object_checked();
    let young = Object::Heap(array(&mut heap, AllocationSpace::Young));
    for index in 0..6 {
        heap.write_word(
            holder.offset(layout::fixed_array_element_offset(index)),
            young.to_word(),
        );
    }

    heap.record_fixed_array_elements(holder, 2, 3);

    let expected: Vec<Address> = (2..5)
        .map(|index| holder.offset(layout::fixed_array_element_offset(index)))
        .collect();
    assert_eq!(heap.store_buffer().entries(), expected.as_slice());
}

#[test]
#[should_panic(expected = "out of bounds")]
fn bulk_element_barrier_checks_bounds() {
    let mut heap = small_heap();
    let holder = array(&mut heap, AllocationSpace::Old);
    heap.record_fixed_array_elements(holder, 2, 3);
}

#[test]
#[should_panic(expected = "element barrier on a non-array")]
fn bulk_element_barrier_requires_an_array() {
    let mut heap = small_heap();
    let code = heap.allocate_code(8).to_object_checked();
    heap.record_fixed_array_elements(code, 0, 1);
}

#[test]
fn draining_the_store_buffer_empties_it() {
    let mut heap = small_heap();
    let holder = array(&mut heap, AllocationSpace::Old);
    let young = Object::Heap(array(&mut heap, AllocationSpace::Young));
    heap.fixed_array_set(holder, 0, young);
    heap.fixed_array_set(holder, 0, young);

    let entries = heap.store_buffer_mut().take_entries();

    assert_eq!(entries.len(), 2, "entries are not deduplicated");
    assert!(heap.store_buffer().is_empty());
    assert!(heap.store_buffer_mut().take_typed_slots().is_empty());
}

proptest! {
    /// Random store sequences record exactly the old-to-young stores.
    #[test]
    fn store_buffer_matches_old_to_young_stores(
        stores in prop::collection::vec((any::<bool>(), any::<bool>(), 0..4usize), 1..40)
    ) {
        let mut heap = small_heap();
        let old_holder = array(&mut heap, AllocationSpace::Old);
        let young_holder = array(&mut heap, AllocationSpace::Young);
        let old_value = Object::Heap(array(&mut heap, AllocationSpace::Old));
        let young_value = Object::Heap(array(&mut heap, AllocationSpace::Young));

        let mut expected = Vec::new();
        for (into_old, store_young, index) in stores {
            let holder = if into_old { old_holder } else { young_holder };
            let value = if store_young { young_value } else { old_value };
            heap.fixed_array_set(holder, index, value);
            if into_old && store_young {
                expected.push(holder.offset(layout::fixed_array_element_offset(index)));
            }
        }

        prop_assert_eq!(heap.store_buffer().entries(), expected.as_slice());
    }
}
