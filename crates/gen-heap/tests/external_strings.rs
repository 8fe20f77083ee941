//! External string table and resource lifetime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gen_heap::{
    layout, Address, AllocationAlignment, AllocationSpace, ExternalStringResource, Heap,
    HeapConfig,
};

struct CountedResource {
    bytes: Vec<u8>,
    disposed: Arc<AtomicUsize>,
}

impl ExternalStringResource for CountedResource {
    fn data(&self) -> &[u8] {
        &self.bytes
    }

    fn dispose(self: Box<Self>) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

fn counted(text: &str, disposed: &Arc<AtomicUsize>) -> Box<dyn ExternalStringResource> {
    Box::new(CountedResource {
        bytes: text.as_bytes().to_vec(),
        disposed: Arc::clone(disposed),
    })
}

fn small_heap() -> Heap {
    Heap::new(HeapConfig {
        page_size: 4096,
        large_object_threshold: 2048,
        young_generation_pages: 2,
        ..HeapConfig::default()
    })
    .expect("heap setup")
}

fn new_string(
    heap: &mut Heap,
    space: AllocationSpace,
    resource: Box<dyn ExternalStringResource>,
) -> Address {
    let string = heap.allocate_external_string(space).to_object_checked();
    heap.set_external_resource(string, resource);
    heap.register_external_string(string);
    string
}

#[test]
fn strings_are_registered_by_generation() {
    let mut heap = small_heap();
    let young = new_string(&mut heap, AllocationSpace::Young, Box::new(String::from("young")));
    let old = new_string(&mut heap, AllocationSpace::Old, Box::new(b"old".to_vec()));

    let table = heap.external_string_table();
    assert_eq!(table.young_strings(), &[young]);
    assert_eq!(table.old_strings(), &[old]);
    assert_eq!(table.len(), 2);
}

#[test]
fn resource_sets_length_and_data() {
    let mut heap = small_heap();
    let string = new_string(&mut heap, AllocationSpace::Old, Box::new(String::from("hello")));

    assert_eq!(heap.read_smi(string, layout::EXTERNAL_STRING_LENGTH_OFFSET), 5);
    assert_eq!(heap.external_string_data(string), Some(&b"hello"[..]));
}

#[test]
fn strings_without_a_resource_have_no_data() {
    let mut heap = small_heap();
    let string = heap
        .allocate_external_string(AllocationSpace::Young)
        .to_object_checked();
    assert_eq!(heap.external_string_data(string), None);
    assert_eq!(heap.read_smi(string, layout::EXTERNAL_STRING_LENGTH_OFFSET), 0);
}

#[test]
fn finalizing_disposes_exactly_once() {
    let mut heap = small_heap();
    let disposed = Arc::new(AtomicUsize::new(0));
    let string = new_string(&mut heap, AllocationSpace::Young, counted("abc", &disposed));

    heap.finalize_external_string(string);
    heap.finalize_external_string(string);

    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(heap.external_string_data(string), None);
    drop(heap);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[test]
fn clean_up_moves_promoted_strings_to_the_old_list() {
    let mut heap = small_heap();
    let promoted = new_string(&mut heap, AllocationSpace::Young, Box::new(String::from("moved")));
    let survivor = new_string(&mut heap, AllocationSpace::Young, Box::new(String::from("stays")));
    let target = heap
        .allocate_raw(
            layout::EXTERNAL_STRING_SIZE,
            AllocationSpace::Old,
            AllocationAlignment::WordAligned,
        )
        .to_object_checked();

    heap.begin_collection();
    heap.copy_block(target, promoted, layout::EXTERNAL_STRING_SIZE);
    for entry in heap.external_string_table_mut().young_strings_mut() {
        if *entry == promoted {
            *entry = target;
        }
    }
    heap.clean_up_young_external_strings();
    heap.end_collection();

    let table = heap.external_string_table();
    assert_eq!(table.young_strings(), &[survivor]);
    assert_eq!(table.old_strings(), &[target]);
    assert_eq!(heap.external_string_data(target), Some(&b"moved"[..]));
}

#[test]
fn promote_all_empties_the_young_list() {
    let mut heap = small_heap();
    let old = new_string(&mut heap, AllocationSpace::Old, Box::new(String::from("a")));
    let young = new_string(&mut heap, AllocationSpace::Young, Box::new(String::from("b")));

    heap.promote_all_young_external_strings();

    let table = heap.external_string_table();
    assert!(table.young_strings().is_empty());
    assert_eq!(table.old_strings(), &[old, young]);
}

#[test]
fn tear_down_finalizes_every_registered_string() {
    let mut heap = small_heap();
    let disposed = Arc::new(AtomicUsize::new(0));
    let young = new_string(&mut heap, AllocationSpace::Young, counted("y", &disposed));
    let old = new_string(&mut heap, AllocationSpace::Old, counted("o", &disposed));

    heap.tear_down_external_strings();

    assert_eq!(disposed.load(Ordering::SeqCst), 2);
    assert!(heap.external_string_table().is_empty());
    assert_eq!(heap.external_string_data(young), None);
    assert_eq!(heap.external_string_data(old), None);
}

#[test]
fn dropping_the_heap_releases_live_resources() {
    let disposed = Arc::new(AtomicUsize::new(0));
    {
        let mut heap = small_heap();
        new_string(&mut heap, AllocationSpace::Young, counted("registered", &disposed));
        let unregistered = heap
            .allocate_external_string(AllocationSpace::Old)
            .to_object_checked();
        heap.set_external_resource(unregistered, counted("unregistered", &disposed));
    }
    assert_eq!(disposed.load(Ordering::SeqCst), 2);
}

#[test]
fn resource_survives_a_retried_allocation() {
    let mut heap = Heap::new(HeapConfig {
        page_size: 4096,
        large_object_threshold: 2048,
        young_generation_pages: 1,
        ..HeapConfig::default()
    })
    .unwrap();
    for _ in 0..2 {
        let _ = heap.allocate_raw(2048, AllocationSpace::Young, AllocationAlignment::WordAligned);
    }
    let resource: Box<dyn ExternalStringResource> = Box::new(String::from("kept"));

    let result = heap.allocate_external_string(AllocationSpace::Young);
    assert_eq!(result.retry_space(), AllocationSpace::Young);

    heap.begin_collection();
    heap.reset_young_generation();
    heap.end_collection();
    let string = new_string(&mut heap, AllocationSpace::Young, resource);
    assert_eq!(heap.external_string_data(string), Some(&b"kept"[..]));
}

#[test]
#[should_panic(expected = "not an external string")]
fn registering_another_kind_is_fatal() {
    let mut heap = small_heap();
    let array = heap
        .allocate_fixed_array(2, AllocationSpace::Old)
        .to_object_checked();
    heap.register_external_string(array);
}

#[test]
#[should_panic(expected = "already has a resource")]
fn a_second_resource_is_fatal() {
    let mut heap = small_heap();
    let string = new_string(&mut heap, AllocationSpace::Old, Box::new(String::from("x")));
    heap.set_external_resource(string, Box::new(String::from("y")));
}
