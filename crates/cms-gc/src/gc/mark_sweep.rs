//! Generic mark-and-sweep.
//!
//! Root-set collection, marking and sweeping are written once against the
//! [`MarkingPolicy`] capability interface. A policy decides how marks are
//! stored and what the worklist looks like; the traversal itself never
//! changes. The concurrent collector uses
//! [`IntrusiveMarking`](crate::gc::cms::IntrusiveMarking); other collector
//! variants plug in their own policy.

use crate::context::MemoryContext;
use crate::extra::ExtraObjectStore;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::gc_assert;
use crate::heap::{self, FinalizerQueue, LockedObjects};
use crate::metrics::{MarkStats, RootSetStatistics, SweepStats};
use crate::object::ObjRef;
use crate::thread::{ThreadData, ThreadRootSource};

/// Mark storage and worklist operations used by the traversal.
pub trait MarkingPolicy {
    /// Worklist of marked objects whose fields are still to be traced.
    type MarkQueue: Default + Send;

    /// Empty the worklist.
    fn clear(&self, queue: &mut Self::MarkQueue);

    /// Take the next object to trace.
    fn try_dequeue(&self, queue: &mut Self::MarkQueue) -> Option<ObjRef>;

    /// Mark `object` and queue it, unless it is already marked. Returns
    /// whether this call marked it.
    fn enqueue(&self, queue: &mut Self::MarkQueue, object: ObjRef) -> bool;

    /// Mark `object` without queueing it.
    fn mark(&self, object: ObjRef);

    /// Whether `object` is marked.
    fn is_marked(&self, object: ObjRef) -> bool;

    /// Clear the mark of `object`; returns whether it was marked.
    fn try_reset_mark(&self, object: ObjRef) -> bool;

    /// Trace the references held by `object`.
    fn process_in_mark(&self, queue: &mut Self::MarkQueue, object: ObjRef) {
        object
            .type_info()
            .for_each_reference(object, |field| process_field_in_mark(self, queue, field));
    }
}

/// Queue a referenced object if it lives on the heap.
///
/// Permanent objects are immortal and stack objects are traced as roots, so
/// neither is ever queued.
pub fn process_field_in_mark<P>(policy: &P, queue: &mut P::MarkQueue, field: ObjRef)
where
    P: MarkingPolicy + ?Sized,
{
    if field.is_heap() {
        policy.enqueue(queue, field);
    }
}

/// Feed one root into the traversal. Returns whether it counts as a root.
pub fn collect_root<P: MarkingPolicy>(
    policy: &P,
    queue: &mut P::MarkQueue,
    root: Option<ObjRef>,
) -> bool {
    let Some(object) = root else {
        return false;
    };
    if object.is_heap() {
        return policy.enqueue(queue, object);
    }
    gc_assert!(
        object.extra_data().is_none(),
        "non-heap root {object:?} carries an auxiliary record"
    );
    policy.process_in_mark(queue, object);
    true
}

/// Make the fresh allocations of `thread` visible to sweep.
pub fn publish_thread(ctx: &MemoryContext, thread: &ThreadData) {
    let _guard = LockGuard::new(LockOrder::ThreadLocal);
    thread.publish(ctx.objects());
}

/// Walk the stack and thread-local roots of `thread`. Returns the number of
/// stack and thread-local roots found.
pub fn collect_root_set_for_thread<P: MarkingPolicy>(
    policy: &P,
    queue: &mut P::MarkQueue,
    thread: &ThreadData,
) -> (usize, usize) {
    let _guard = LockGuard::new(LockOrder::ThreadLocal);
    let (mut stack, mut thread_local) = (0, 0);
    thread.for_each_root(|source, root| {
        if collect_root(policy, queue, root) {
            match source {
                ThreadRootSource::Stack => stack += 1,
                ThreadRootSource::ThreadLocal => thread_local += 1,
            }
        }
    });
    crate::tracing::internal::log_thread_root_set(thread.id(), stack, thread_local);
    (stack, thread_local)
}

/// Walk the global and stable-reference roots after compacting pending
/// deletions. Returns the number of global and stable roots found.
pub fn collect_root_set_globals<P: MarkingPolicy>(
    policy: &P,
    queue: &mut P::MarkQueue,
    ctx: &MemoryContext,
) -> (usize, usize) {
    let _guard = LockGuard::new(LockOrder::RootRegistry);
    ctx.globals().process_deletions();
    ctx.stable_refs().process_deletions();
    let (mut global, mut stable) = (0, 0);
    ctx.globals().for_each(|root| {
        if collect_root(policy, queue, root) {
            global += 1;
        }
    });
    ctx.stable_refs().for_each(|object| {
        if collect_root(policy, queue, Some(object)) {
            stable += 1;
        }
    });
    crate::tracing::internal::log_global_root_set(global, stable);
    (global, stable)
}

/// Collect the full root set into a cleared `queue`.
///
/// Only threads accepted by `filter` are published and walked. Objects of
/// threads that detached since the last collection are published as well.
/// Publishing resets mark slots, so every thread is published before the
/// first root is queued.
pub fn collect_root_set<P, F>(
    policy: &P,
    queue: &mut P::MarkQueue,
    ctx: &MemoryContext,
    mut filter: F,
) -> RootSetStatistics
where
    P: MarkingPolicy,
    F: FnMut(&ThreadData) -> bool,
{
    policy.clear(queue);
    let mut stats = RootSetStatistics::default();
    {
        let _guard = LockGuard::new(LockOrder::ThreadRegistry);
        let threads = ctx.threads().lock_for_iter();
        let selected: Vec<_> = threads.iter().filter(|t| filter(t)).collect();
        for thread in &selected {
            publish_thread(ctx, thread);
        }
        {
            let _guard = LockGuard::new(LockOrder::ObjectStore);
            ctx.objects().publish_orphans();
        }
        for thread in selected {
            let (stack, thread_local) = collect_root_set_for_thread(policy, queue, thread);
            stats.stack_references += stack;
            stats.thread_local_references += thread_local;
        }
    }
    let (global, stable) = collect_root_set_globals(policy, queue, ctx);
    stats.global_references = global;
    stats.stable_references = stable;
    crate::tracing::internal::log_root_set(&stats);
    stats
}

/// Drain the worklist, tracing every reachable heap object exactly once.
pub fn mark<P: MarkingPolicy>(policy: &P, queue: &mut P::MarkQueue) -> MarkStats {
    let mut stats = MarkStats::default();
    while let Some(object) = policy.try_dequeue(queue) {
        gc_assert!(
            object.is_heap(),
            "non-heap object {object:?} found in the mark queue"
        );
        stats.alive_heap_set += 1;
        stats.alive_heap_set_bytes += heap::allocated_size(object);
        policy.process_in_mark(queue, object);
        if let Some(counter) = object.extra_data().and_then(|extra| extra.weak_counter()) {
            gc_assert!(
                counter.is_heap(),
                "weak reference counter {counter:?} is not a heap object"
            );
            policy.enqueue(queue, counter);
        }
    }
    stats
}

/// Sweep the auxiliary records of dead objects.
///
/// Must run before [`sweep`], while the marks are still in place.
pub fn sweep_extra_objects<P: MarkingPolicy>(policy: &P, extra_objects: &ExtraObjectStore) {
    let _guard = LockGuard::new(LockOrder::ExtraObjects);
    extra_objects.process_deletions();
    let mut records = extra_objects.lock_for_iter();
    let mut index = 0;
    while let Some(record) = records.get(index) {
        let base = record.base_object();
        gc_assert!(
            base.is_heap(),
            "auxiliary record attached to non-heap object {base:?}"
        );
        let published = heap::NodePtr::from_object(base).is_published();
        if !published || policy.is_marked(base) || record.in_finalizer_queue() {
            index += 1;
            continue;
        }
        record.clear_weak_reference_counter();
        if record.has_associated_object() {
            record.detach_associated_object();
            index += 1;
        } else {
            records.erase_and_advance(index);
        }
    }
}

/// Whether an unmarked object must go through the finalizer processor.
fn has_finalizers(object: ObjRef) -> bool {
    object.type_info().has_finalizer()
        || object
            .extra_data()
            .is_some_and(crate::extra::ExtraObjectData::in_finalizer_queue)
}

/// Sweep the object store: reset survivors, queue finalizable objects,
/// free the rest.
pub fn sweep<P: MarkingPolicy>(
    policy: &P,
    objects: &mut LockedObjects<'_>,
) -> (FinalizerQueue, SweepStats) {
    let mut finalizer_queue = FinalizerQueue::new();
    let mut stats = SweepStats::default();
    let mut index = 0;
    while let Some(object) = objects.get(index) {
        if policy.try_reset_mark(object) {
            stats.kept += 1;
            index += 1;
        } else if has_finalizers(object) {
            stats.finalizable += 1;
            objects.move_and_advance(index, &mut finalizer_queue);
        } else {
            stats.swept += 1;
            stats.swept_bytes += heap::allocated_size(object);
            objects.erase_and_advance(index);
        }
    }
    (finalizer_queue, stats)
}

/// Lock the object store of `ctx` and [`sweep`] it.
pub fn sweep_store<P: MarkingPolicy>(policy: &P, ctx: &MemoryContext) -> (FinalizerQueue, SweepStats) {
    let _guard = LockGuard::new(LockOrder::ObjectStore);
    let mut objects = ctx.objects().lock_for_iter(ctx.allocator());
    sweep(policy, &mut objects)
}
