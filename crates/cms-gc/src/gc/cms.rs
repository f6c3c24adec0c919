//! Concurrent mark-and-sweep collector.
//!
//! One collection goes through these steps:
//!
//! 1. **Suspend**: win the suspension request, flag every registered mutator
//!    as participating and wait until each one is parked or native.
//! 2. **Root set**: publish every participating thread and collect roots
//!    from stacks, thread locals, globals and stable references.
//! 3. **Resume**: mutators continue; the rest runs on the collector.
//! 4. **Mark**: drain the intrusive mark queue.
//! 5. **Sweep**: auxiliary records first, then the object store. Unreachable
//!    objects with finalizers go to the [`FinalizerProcessor`].
//!
//! Collections run on a dedicated thread unless the collector is switched to
//! [`MarkingBehavior::Inline`], in which case the requesting thread runs them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::{GcConfig, MarkingBehavior};
use crate::context::MemoryContext;
use crate::gc::finalizer::FinalizerProcessor;
use crate::gc::mark_sweep::{self, MarkingPolicy};
use crate::gc::scheduler::GcScheduler;
use crate::gc::state::{GcPhase, GcStateHolder};
use crate::heap::{NodePtr, ObjectQueue};
use crate::metrics::{GcStatistics, PhaseTimer};
use crate::object::ObjRef;
use crate::thread::{ThreadData, ThreadState};
use crate::tracing::internal as trace;

const COLLECTOR_THREAD_NAME: &str = "gc-collector";

/// Marks stored in the object's own mark slot; the mark queue is linked
/// through the same slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntrusiveMarking;

impl MarkingPolicy for IntrusiveMarking {
    type MarkQueue = ObjectQueue;

    fn clear(&self, queue: &mut ObjectQueue) {
        queue.clear();
    }

    fn try_dequeue(&self, queue: &mut ObjectQueue) -> Option<ObjRef> {
        let data = queue.try_pop_front()?;
        let node = NodePtr::from_object_data(data);
        // Leaving the queue turns the link into a plain mark.
        node.object_data().mark();
        Some(node.object())
    }

    fn enqueue(&self, queue: &mut ObjectQueue, object: ObjRef) -> bool {
        let data = NodePtr::from_object(object).object_data_ptr();
        // SAFETY: a traced heap node is not freed before the sweep that
        // follows this mark.
        unsafe { queue.try_push_front(data) }
    }

    fn mark(&self, object: ObjRef) {
        NodePtr::from_object(object).object_data().mark();
    }

    fn is_marked(&self, object: ObjRef) -> bool {
        NodePtr::from_object(object).object_data().is_marked()
    }

    fn try_reset_mark(&self, object: ObjRef) -> bool {
        NodePtr::from_object(object).object_data().try_reset_mark()
    }
}

#[derive(Debug)]
struct GcShared {
    ctx: Arc<MemoryContext>,
    policy: IntrusiveMarking,
    state: Arc<GcStateHolder>,
    mark_queue: Mutex<ObjectQueue>,
    scheduler: Box<dyn GcScheduler>,
    finalizer: FinalizerProcessor,
    stats: Arc<GcStatistics>,
}

impl GcShared {
    /// Run the collection of `epoch`. Returns `false` if the epoch was
    /// already collected or claimed, or another collector stopped the world.
    fn perform_full_gc(&self, epoch: u64) -> bool {
        if !self.state.start(epoch) {
            return false;
        }
        let threads = self.ctx.threads();
        let suspension = threads.suspension();
        if !suspension.request_threads_suspension() {
            trace::log_suspension_lost(epoch);
            self.state.abandon(epoch);
            return false;
        }

        let _span = trace::trace_gc_collection(epoch);
        self.stats.on_start(epoch, self.ctx.allocator().usage());
        self.stats.on_pause_start();
        let pause = PhaseTimer::start();
        self.scheduler.on_collection_requested();

        for thread in threads.lock_for_iter().iter() {
            thread.gc().set_marking();
        }
        suspension.wait_for_threads_suspension(threads, |t| t.gc().is_marking());

        let mut queue = self.mark_queue.lock();
        let roots = {
            let _phase = trace::trace_phase(trace::GcPhase::RootSet);
            mark_sweep::collect_root_set(&self.policy, &mut queue, &self.ctx, |thread| {
                let participating = thread.gc().is_marking();
                thread.gc().clear_marking();
                participating
            })
        };
        self.state.set_phase(GcPhase::RootSetCollected);
        self.stats.on_root_set(roots);
        suspension.resume_threads(threads);
        self.stats.on_pause_end();
        trace::log_pause(epoch, pause.elapsed());

        self.state.set_phase(GcPhase::Marking);
        let timer = PhaseTimer::start();
        let mut mark_stats = {
            let _phase = trace::trace_phase(trace::GcPhase::Mark);
            mark_sweep::mark(&self.policy, &mut queue)
        };
        drop(queue);
        mark_stats.root_set_size = roots.total();
        trace::log_mark_finished(&mark_stats, timer.elapsed());
        self.stats.on_mark(mark_stats);

        self.state.set_phase(GcPhase::Sweeping);
        let timer = PhaseTimer::start();
        let (finalizer_queue, sweep_stats) = {
            let _phase = trace::trace_phase(trace::GcPhase::Sweep);
            mark_sweep::sweep_extra_objects(&self.policy, self.ctx.extra_objects());
            mark_sweep::sweep_store(&self.policy, &self.ctx)
        };
        trace::log_sweep_finished(&sweep_stats, timer.elapsed());
        self.stats.on_sweep(sweep_stats);

        if let Some(info) = self.stats.on_finish(self.ctx.allocator().usage()) {
            self.scheduler.on_collection_finished(&info);
        }
        // Queues reach the processor in epoch order while the claim is held.
        self.finalizer.schedule_tasks(finalizer_queue, epoch);
        self.state.finish(epoch);
        true
    }

    fn collector_loop(&self) {
        trace::log_thread_lifecycle(COLLECTOR_THREAD_NAME, true);
        while let Some(epoch) = self.state.wait_scheduled() {
            self.perform_full_gc(epoch);
        }
        trace::log_thread_lifecycle(COLLECTOR_THREAD_NAME, false);
    }
}

/// The collector orchestrator.
///
/// Owns the collector thread, the collection request protocol and the
/// finalizer processor. Dropping it stops both threads after the finalizer
/// queues already handed over were drained.
#[derive(Debug)]
pub struct ConcurrentMarkAndSweep {
    shared: Arc<GcShared>,
    collector: Option<JoinHandle<()>>,
}

impl ConcurrentMarkAndSweep {
    /// Create a collector over `ctx` and start its thread.
    #[must_use]
    pub fn new(ctx: Arc<MemoryContext>, config: &GcConfig, scheduler: Box<dyn GcScheduler>) -> Self {
        let state = Arc::new(GcStateHolder::new());
        state.set_inline(config.marking_behavior == MarkingBehavior::Inline);
        let stats = Arc::new(GcStatistics::new(config.history_capacity));

        let finalizer = {
            let state = Arc::clone(&state);
            let stats = Arc::clone(&stats);
            FinalizerProcessor::new(
                Arc::clone(&ctx),
                Box::new(move |epoch, finalized| {
                    stats.on_finalizers_done(epoch, finalized);
                    state.finalized(epoch);
                }),
            )
        };
        if config.start_finalizer_thread {
            finalizer.start_if_needed();
        }

        let shared = Arc::new(GcShared {
            ctx,
            policy: IntrusiveMarking,
            state,
            mark_queue: Mutex::new(ObjectQueue::new()),
            scheduler,
            finalizer,
            stats,
        });
        let collector = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(COLLECTOR_THREAD_NAME.to_owned())
                .spawn(move || shared.collector_loop())
        };
        match collector {
            Ok(handle) => Self {
                shared,
                collector: Some(handle),
            },
            Err(err) => crate::error::fatal(format_args!(
                "cannot spawn {COLLECTOR_THREAD_NAME}: {err}"
            )),
        }
    }

    /// Run `f` with `thread` switched to native, so a collection never waits
    /// for a thread that is itself blocked on the collector.
    fn in_native<R>(&self, thread: Option<&ThreadData>, f: impl FnOnce() -> R) -> R {
        let suspension = self.shared.ctx.threads().suspension();
        let Some(thread) = thread.filter(|t| t.state() == ThreadState::Runnable) else {
            return f();
        };
        thread.set_state(ThreadState::Native, suspension);
        let result = f();
        thread.set_state(ThreadState::Runnable, suspension);
        result
    }

    fn request(&self, thread: Option<&ThreadData>) -> u64 {
        let request = self.shared.state.schedule();
        if request.inline {
            self.in_native(thread, || self.shared.perform_full_gc(request.epoch));
        }
        request.epoch
    }

    /// Block until `epoch` finished. An inline request whose runner gave up
    /// is collected by the waiter itself.
    fn wait_finished(&self, thread: Option<&ThreadData>, epoch: u64) {
        self.in_native(thread, || {
            while let Some(pending) = self.shared.state.wait_epoch_finished_or_unclaimed(epoch) {
                if !self.shared.perform_full_gc(pending) {
                    thread::yield_now();
                }
            }
        });
    }

    /// Allocation safepoint: called before every allocation of `size` bytes
    /// by `thread`. May request a collection and park the thread.
    pub fn safe_point_allocation(&self, thread: &ThreadData, size: usize) {
        if self
            .shared
            .scheduler
            .on_safe_point_allocation(thread.gc().scheduler(), size)
        {
            self.request(Some(thread));
        }
        self.on_suspend_for_gc(thread);
    }

    /// Park `thread` if a collection is stopping the world. Returns whether
    /// it parked; once resumed its roots were already collected.
    pub fn on_suspend_for_gc(&self, thread: &ThreadData) -> bool {
        thread.suspend_if_requested(self.shared.ctx.threads().suspension())
    }

    /// Request a collection and block until it finished sweeping. Returns
    /// the epoch waited for.
    pub fn schedule_and_wait_full_gc(&self, thread: Option<&ThreadData>) -> u64 {
        let epoch = self.request(thread);
        self.wait_finished(thread, epoch);
        epoch
    }

    /// Like [`schedule_and_wait_full_gc`](Self::schedule_and_wait_full_gc),
    /// but also wait until the finalizers of that collection ran.
    pub fn schedule_and_wait_full_gc_with_finalizers(&self, thread: Option<&ThreadData>) -> u64 {
        let epoch = self.request(thread);
        self.wait_finished(thread, epoch);
        self.in_native(thread, || self.shared.state.wait_epoch_finalized(epoch));
        epoch
    }

    /// Allocation of `size` bytes by `thread` failed. Reclaims as much as a
    /// full collection and its finalizers can before the caller retries.
    pub fn on_oom(&self, thread: &ThreadData, size: usize) {
        trace::log_out_of_memory(thread.id(), size);
        self.schedule_and_wait_full_gc_with_finalizers(Some(thread));
    }

    /// Switch who runs requested collections.
    pub fn set_marking_behavior(&self, behavior: MarkingBehavior) {
        self.shared
            .state
            .set_inline(behavior == MarkingBehavior::Inline);
    }

    /// Who runs requested collections.
    #[must_use]
    pub fn marking_behavior(&self) -> MarkingBehavior {
        if self.shared.state.is_inline() {
            MarkingBehavior::Inline
        } else {
            MarkingBehavior::Dedicated
        }
    }

    /// Start the finalizer thread unless it runs already.
    pub fn start_finalizer_thread_if_needed(&self) {
        self.shared.finalizer.start_if_needed();
    }

    /// Drain pending finalizers and stop the finalizer thread.
    pub fn stop_finalizer_thread_if_running(&self) {
        self.shared.finalizer.stop_if_running();
    }

    /// Whether the finalizer thread is running.
    #[must_use]
    pub fn finalizer_thread_is_running(&self) -> bool {
        self.shared.finalizer.is_running()
    }

    /// Collection statistics.
    #[must_use]
    pub fn statistics(&self) -> &GcStatistics {
        &self.shared.stats
    }

    /// Collection state and epoch counters.
    #[must_use]
    pub fn state(&self) -> &GcStateHolder {
        &self.shared.state
    }

    /// Number of completed collections.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.state.epoch()
    }

    /// Current collector phase.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.shared.state.phase()
    }
}

impl Drop for ConcurrentMarkAndSweep {
    fn drop(&mut self) {
        self.shared.state.shutdown();
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
        self.shared.finalizer.stop_if_running();
    }
}
