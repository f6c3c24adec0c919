//! End-to-end collection scenarios.
//!
//! A single globally rooted object, deferred release of a finalizable
//! object, and two threads racing blocking collection requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cms_gc::{
    allocated_size, mark_state, GcConfig, MarkState, MarkingBehavior, ObjRef, Runtime,
    ThreadState, TypeInfo, WORD,
};

static BYTES: TypeInfo = TypeInfo::primitive_array("Bytes", 1);

fn inline_runtime() -> Runtime {
    Runtime::new(
        GcConfig::default()
            .with_marking_behavior(MarkingBehavior::Inline)
            .with_allocation_threshold(None),
    )
}

#[test]
fn test_globally_rooted_object_lives_until_unrooted() {
    let runtime = inline_runtime();
    let mutator = runtime.attach_thread();
    let a = mutator.allocate_array(&BYTES, 20 - WORD).unwrap();
    assert_eq!(allocated_size(a), 20);
    let global = runtime.create_global(Some(a));

    mutator.collect();
    let info = runtime.statistics().last_gc_info().unwrap();
    assert_eq!(info.root_set.unwrap().total(), 1);
    let mark = info.mark_stats.unwrap();
    assert_eq!(mark.root_set_size, 1);
    assert_eq!(mark.alive_heap_set, 1);
    assert_eq!(mark.alive_heap_set_bytes, 20);
    assert_eq!(info.sweep_stats.unwrap().kept, 1);
    assert_eq!(mark_state(a), MarkState::Unmarked);

    global.set(None);
    mutator.collect();
    let info = runtime.statistics().last_gc_info().unwrap();
    assert_eq!(info.mark_stats.unwrap().alive_heap_set, 0);
    let sweep = info.sweep_stats.unwrap();
    assert_eq!(sweep.swept, 1);
    assert_eq!(sweep.swept_bytes, 20);
    assert_eq!(runtime.context().allocator().allocated_bytes(), 0);
    assert!(runtime.context().objects().is_empty());
}

// ============================================================================
// Finalizable object
// ============================================================================

const MAGIC: usize = 0x5EED_F00D;

static FINALIZER_GATE: parking_lot::Mutex<()> = parking_lot::const_mutex(());
static FINALIZED_WITH_MAGIC: AtomicUsize = AtomicUsize::new(0);

fn check_payload(object: ObjRef) {
    let _gate = FINALIZER_GATE.lock();
    let value = unsafe { object.payload().cast::<usize>().read() };
    if value == MAGIC {
        FINALIZED_WITH_MAGIC.fetch_add(1, Ordering::SeqCst);
    }
}

static FINALIZABLE: TypeInfo = TypeInfo::object("Finalizable", WORD, &[]).with_finalizer(check_payload);

#[test]
fn test_finalizable_object_is_moved_not_erased() {
    let runtime = Runtime::new(GcConfig::default().with_allocation_threshold(None));
    let mutator = runtime.attach_thread();
    let b = mutator.allocate(&FINALIZABLE).unwrap();
    unsafe { b.payload().cast::<usize>().write(MAGIC) };

    let gate = FINALIZER_GATE.lock();
    let epoch = mutator.collect();
    let sweep = runtime.statistics().last_sweep_stats().unwrap();
    assert_eq!(sweep.finalizable, 1);
    assert_eq!(sweep.swept, 0);
    assert!(runtime.context().objects().is_empty());
    // Still allocated: the finalizer thread is blocked on the gate.
    assert_eq!(runtime.context().allocator().allocated_objects(), 1);
    assert_eq!(FINALIZED_WITH_MAGIC.load(Ordering::SeqCst), 0);
    drop(gate);

    mutator.run_native(|| runtime.gc().state().wait_epoch_finalized(epoch));
    assert_eq!(FINALIZED_WITH_MAGIC.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.context().allocator().allocated_objects(), 0);
    assert_eq!(runtime.statistics().total_objects_finalized(), 1);
    let info = runtime.statistics().last_gc_info().unwrap();
    assert!(info.finalizers_done_time.is_some());
}

// ============================================================================
// Concurrent blocking requests
// ============================================================================

fn native_threads(runtime: &Runtime) -> usize {
    runtime
        .context()
        .threads()
        .lock_for_iter()
        .iter()
        .filter(|t| t.state() == ThreadState::Native)
        .count()
}

#[test]
fn test_concurrent_requests_merge_into_one_collection() {
    let runtime = Runtime::new(GcConfig::default().with_allocation_threshold(None));
    // Runnable and never at a safepoint: no collection can finish before
    // this thread turns native, so both requests target the same epoch.
    let main = runtime.attach_thread();
    let barrier = Arc::new(Barrier::new(3));

    let requesters: Vec<_> = (0..2)
        .map(|_| {
            let runtime = runtime.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mutator = runtime.attach_thread();
                barrier.wait();
                mutator.collect()
            })
        })
        .collect();

    barrier.wait();
    while native_threads(&runtime) < 2 {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(runtime.epoch(), 0);

    let epochs: Vec<u64> = main.run_native(|| {
        requesters
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });
    assert_eq!(epochs, vec![1, 1]);
    assert_eq!(runtime.epoch(), 1);
    assert_eq!(runtime.statistics().total_collections(), 1);
}

#[test]
fn test_request_after_completion_starts_new_collection() {
    let runtime = inline_runtime();
    let mutator = runtime.attach_thread();
    assert_eq!(mutator.collect(), 1);
    assert_eq!(mutator.collect(), 2);
    assert_eq!(mutator.run_native(|| runtime.collect()), 3);
    assert_eq!(runtime.statistics().total_collections(), 3);
}
