//! Finalizer processing tests.
//!
//! Foreign handles and type finalizers run on the finalizer thread after the
//! sweep that found their object dead; the memory is freed afterwards.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cms_gc::{weak_referent, GcConfig, MarkingBehavior, ObjRef, Runtime, TypeInfo, WORD};

static PLAIN: TypeInfo = TypeInfo::object("Plain", WORD, &[]);

fn inline_runtime() -> Runtime {
    Runtime::new(
        GcConfig::default()
            .with_marking_behavior(MarkingBehavior::Inline)
            .with_allocation_threshold(None),
    )
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_foreign_handle_released_with_its_object() {
    let runtime = inline_runtime();
    let mutator = runtime.attach_thread();
    let released = Arc::new(AtomicBool::new(false));
    let object = mutator.allocate(&PLAIN).unwrap();
    let index = mutator.push_root(Some(object));
    assert!(mutator
        .attach_foreign_handle(object, Box::new(DropFlag(Arc::clone(&released))))
        .is_none());

    mutator.collect_with_finalizers();
    assert!(!released.load(Ordering::SeqCst));
    assert!(object.extra_data().is_some_and(|extra| extra.has_associated_object()));

    mutator.set_root(index, None);
    mutator.collect_with_finalizers();
    assert!(released.load(Ordering::SeqCst));
    let sweep = runtime.statistics().last_sweep_stats().unwrap();
    assert_eq!(sweep.finalizable, 1);
    assert_eq!(runtime.context().allocator().allocated_objects(), 0);

    // The record is compacted by the next sweep.
    assert_eq!(runtime.context().extra_objects().len(), 1);
    mutator.collect();
    assert!(runtime.context().extra_objects().is_empty());
}

#[test]
fn test_replacing_a_handle_returns_the_old_one() {
    let runtime = inline_runtime();
    let mutator = runtime.attach_thread();
    let object = mutator.allocate(&PLAIN).unwrap();
    mutator.push_root(Some(object));

    assert!(mutator.attach_foreign_handle(object, Box::new(1_u32)).is_none());
    let old = mutator
        .attach_foreign_handle(object, Box::new(2_u32))
        .unwrap();
    assert_eq!(old.downcast_ref::<u32>(), Some(&1));
    assert_eq!(runtime.context().extra_objects().len(), 1);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalized(_: ObjRef) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

static RESOURCE: TypeInfo = TypeInfo::object("Resource", WORD, &[]).with_finalizer(count_finalized);

#[test]
fn test_weak_reference_cleared_before_finalizer_runs() {
    let runtime = inline_runtime();
    let mutator = runtime.attach_thread();
    let object = mutator.allocate(&RESOURCE).unwrap();
    let index = mutator.push_root(Some(object));
    let weak = mutator.create_weak_reference(object).unwrap();
    mutator.push_root(Some(weak));

    mutator.collect_with_finalizers();
    assert_eq!(weak_referent(weak), Some(object));
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);

    mutator.set_root(index, None);
    mutator.collect_with_finalizers();
    assert_eq!(weak_referent(weak), None);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert!(runtime.context().extra_objects().is_empty());
    // Only the counter cell is left.
    assert_eq!(runtime.context().allocator().allocated_objects(), 1);
    assert_eq!(runtime.statistics().total_objects_finalized(), 1);
}

#[test]
fn test_finalizer_thread_restarts_on_demand() {
    let runtime = Runtime::new(
        GcConfig::default()
            .with_marking_behavior(MarkingBehavior::Inline)
            .with_allocation_threshold(None)
            .with_start_finalizer_thread(false),
    );
    let gc = runtime.gc();
    assert!(!gc.finalizer_thread_is_running());

    let mutator = runtime.attach_thread();
    // Nothing to finalize: the epoch is reported without starting a thread.
    let epoch = mutator.collect_with_finalizers();
    assert_eq!(gc.state().finalized_epoch(), epoch);
    assert!(!gc.finalizer_thread_is_running());

    let released = Arc::new(AtomicBool::new(false));
    let object = mutator.allocate(&PLAIN).unwrap();
    mutator.attach_foreign_handle(object, Box::new(DropFlag(Arc::clone(&released))));
    mutator.collect_with_finalizers();
    assert!(released.load(Ordering::SeqCst));
    assert!(gc.finalizer_thread_is_running());

    gc.stop_finalizer_thread_if_running();
    assert!(!gc.finalizer_thread_is_running());
    gc.start_finalizer_thread_if_needed();
    assert!(gc.finalizer_thread_is_running());
}

#[test]
fn test_teardown_releases_pending_handles() {
    let released = Arc::new(AtomicBool::new(false));
    {
        let runtime = inline_runtime();
        let mutator = runtime.attach_thread();
        let object = mutator.allocate(&PLAIN).unwrap();
        mutator.push_root(Some(object));
        mutator.attach_foreign_handle(object, Box::new(DropFlag(Arc::clone(&released))));
        assert!(!released.load(Ordering::SeqCst));
    }
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn test_concurrent_waiters_see_their_own_finalizers() {
    let runtime = inline_runtime();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                let mutator = runtime.attach_thread();
                for _ in 0..20 {
                    let released = Arc::new(AtomicBool::new(false));
                    let object = mutator.allocate(&PLAIN).unwrap();
                    mutator.attach_foreign_handle(object, Box::new(DropFlag(Arc::clone(&released))));
                    // The first request may merge with a collection that
                    // started before the object was published.
                    mutator.collect_with_finalizers();
                    mutator.collect_with_finalizers();
                    assert!(released.load(Ordering::SeqCst));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(runtime.gc().state().finalized_epoch(), runtime.epoch());
}
