//! Multi-threaded allocation stress.
//!
//! Several mutators build linked lists while allocation-triggered
//! collections run; every list must come out intact.

use std::sync::{Arc, Barrier};
use std::thread;

use cms_gc::{GcConfig, MarkingBehavior, Mutator, ObjRef, Runtime, TypeInfo, WORD};

/// `next` at offset 0, a plain value at offset `WORD`.
static LIST_NODE: TypeInfo = TypeInfo::object("ListNode", 2 * WORD, &[0]);

fn value(node: ObjRef) -> usize {
    unsafe { node.payload().add(WORD).cast::<usize>().read() }
}

/// Prepend `len` nodes holding `0..len` to the list rooted at `head`.
fn build_list(mutator: &Mutator, head: usize, len: usize) {
    for i in 0..len {
        let node = mutator.allocate(&LIST_NODE).unwrap();
        // The node is unreachable until rooted, so it can be initialised
        // without racing the marker.
        unsafe { node.payload().add(WORD).cast::<usize>().write(i) };
        node.store_field(0, mutator.root(head));
        mutator.set_root(head, Some(node));
    }
}

fn check_list(mutator: &Mutator, head: usize, len: usize) {
    let mut current = mutator.root(head);
    let mut expected = len;
    while let Some(node) = current {
        expected -= 1;
        assert_eq!(value(node), expected);
        current = node.load_field(0);
    }
    assert_eq!(expected, 0);
}

fn run_workers(runtime: &Runtime, threads: usize, len: usize) {
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let runtime = runtime.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mutator = runtime.attach_thread();
                mutator.run_native(|| barrier.wait());
                let head = mutator.push_root(None);
                build_list(&mutator, head, len);
                check_list(&mutator, head, len);
                mutator.safe_point();
                check_list(&mutator, head, len);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_dedicated_collector_under_allocation_pressure() {
    let runtime = Runtime::new(GcConfig::default().with_allocation_threshold(Some(64 * 1024)));
    run_workers(&runtime, 4, 5000);
    assert!(runtime.statistics().total_collections() >= 1);

    // Every mutator detached; their lists are garbage now. A request merges
    // with a collection already in flight, so the second one is guaranteed
    // to snapshot after the last detach.
    runtime.collect();
    runtime.collect();
    assert_eq!(runtime.context().allocator().allocated_objects(), 0);
    assert!(runtime.context().threads().is_empty());
}

#[test]
fn test_inline_collections_from_many_threads() {
    let runtime = Runtime::new(
        GcConfig::default()
            .with_marking_behavior(MarkingBehavior::Inline)
            .with_allocation_threshold(Some(4 * 1024)),
    );
    run_workers(&runtime, 3, 2000);
    assert!(runtime.statistics().total_collections() >= 1);

    runtime.collect();
    runtime.collect();
    assert_eq!(runtime.context().allocator().allocated_objects(), 0);
}

#[test]
fn test_collections_keep_a_long_lived_list() {
    let runtime = Runtime::new(GcConfig::default().with_allocation_threshold(Some(16 * 1024)));
    let mutator = runtime.attach_thread();
    let head = mutator.push_root(None);
    build_list(&mutator, head, 1000);

    // Churn: garbage only, the list stays untouched.
    for _ in 0..10_000 {
        mutator.allocate(&LIST_NODE).unwrap();
    }
    check_list(&mutator, head, 1000);

    mutator.collect();
    mutator.collect();
    assert_eq!(runtime.context().objects().len(), 1000);
}
