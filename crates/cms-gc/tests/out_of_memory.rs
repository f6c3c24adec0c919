//! Out-of-memory handling.
//!
//! A failed allocation runs one full collection, waits for its finalizers
//! and retries once before the error reaches the caller.

use cms_gc::{AllocError, GcConfig, MarkingBehavior, Runtime, TypeInfo, WORD};

static PLAIN: TypeInfo = TypeInfo::object("Plain", WORD, &[]);
static WORDS: TypeInfo = TypeInfo::primitive_array("Words", WORD);

fn limited_runtime(behavior: MarkingBehavior, words: usize) -> Runtime {
    Runtime::new(
        GcConfig::default()
            .with_marking_behavior(behavior)
            .with_allocation_threshold(None)
            .with_max_heap_bytes(Some(words * WORD)),
    )
}

#[test]
fn test_limit_exceeded_after_collection() {
    let runtime = limited_runtime(MarkingBehavior::Inline, 4);
    let mutator = runtime.attach_thread();
    for _ in 0..4 {
        let object = mutator.allocate(&PLAIN).unwrap();
        mutator.push_root(Some(object));
    }
    assert_eq!(runtime.statistics().total_collections(), 0);

    let err = mutator.allocate(&PLAIN).unwrap_err();
    assert_eq!(
        err,
        AllocError::HeapLimitExceeded {
            requested: WORD,
            limit: 4 * WORD,
        }
    );
    assert_eq!(runtime.statistics().total_collections(), 1);
    assert_eq!(runtime.context().allocator().allocated_objects(), 4);

    mutator.pop_root();
    let object = mutator.allocate(&PLAIN).unwrap();
    assert!(object.is_heap());
    assert_eq!(runtime.statistics().total_collections(), 2);
    assert_eq!(runtime.statistics().last_sweep_stats().unwrap().swept, 1);
}

#[test]
fn test_garbage_is_reclaimed_on_demand_by_the_collector_thread() {
    let runtime = limited_runtime(MarkingBehavior::Dedicated, 8);
    let mutator = runtime.attach_thread();
    let kept = mutator.allocate(&PLAIN).unwrap();
    mutator.push_root(Some(kept));

    for _ in 0..64 {
        mutator.allocate(&PLAIN).unwrap();
    }
    let collections = runtime.statistics().total_collections();
    assert!(collections >= 1);
    assert!(runtime.context().allocator().allocated_bytes() <= 8 * WORD);
    assert_eq!(mutator.root(0), Some(kept));
}

#[test]
fn test_request_larger_than_the_heap_fails() {
    let runtime = limited_runtime(MarkingBehavior::Inline, 4);
    let mutator = runtime.attach_thread();
    let err = mutator.allocate_array(&WORDS, 4).unwrap_err();
    assert_eq!(
        err,
        AllocError::HeapLimitExceeded {
            requested: 5 * WORD,
            limit: 4 * WORD,
        }
    );
    assert_eq!(runtime.context().allocator().allocated_bytes(), 0);
}

#[test]
fn test_size_overflow_skips_collection() {
    let runtime = limited_runtime(MarkingBehavior::Inline, 4);
    let mutator = runtime.attach_thread();
    assert_eq!(
        mutator.allocate_array(&WORDS, usize::MAX).unwrap_err(),
        AllocError::SizeOverflow
    );
    assert_eq!(
        mutator.allocate_array(&WORDS, usize::MAX / WORD).unwrap_err(),
        AllocError::SizeOverflow
    );
    assert_eq!(runtime.statistics().total_collections(), 0);
    assert!(AllocError::SizeOverflow.to_string().contains("overflow"));
}
