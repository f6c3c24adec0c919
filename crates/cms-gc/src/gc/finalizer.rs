//! Finalizer processor.
//!
//! Sweep hands every finalizer queue it produces to this processor together
//! with the epoch that produced it. A dedicated thread drains the queues in
//! order: it runs type finalizers, releases detached foreign handles, drops
//! auxiliary records and only then frees the objects. When a queue is done
//! the epoch is reported through the completion callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::context::MemoryContext;
use crate::heap::{FinalizerQueue, NodePtr};

const THREAD_NAME: &str = "gc-finalizer";

/// Called with the epoch and object count of every drained queue.
pub type FinalizersDone = Box<dyn Fn(u64, usize) + Send + Sync>;

enum Task {
    Finalize { queue: FinalizerQueue, epoch: u64 },
    Shutdown,
}

struct Inner {
    ctx: Arc<MemoryContext>,
    on_done: FinalizersDone,
    running: AtomicBool,
}

impl Inner {
    fn process(&self, mut queue: FinalizerQueue) -> usize {
        let mut finalized = 0;
        while let Some(data) = queue.try_pop_front() {
            let node = NodePtr::from_object_data(data);
            node.object_data().try_reset_mark();
            let object = node.object();
            if let Some(finalizer) = object.type_info().finalizer() {
                finalizer(object);
            }
            if let Some(extra) = object.extra_data() {
                drop(extra.take_associated_object());
                self.ctx.extra_objects().schedule_deletion(extra);
            }
            // SAFETY: the node left the store during sweep and just left the
            // queue; its record was uninstalled above.
            unsafe { self.ctx.allocator().free(node) };
            finalized += 1;
        }
        finalized
    }

    fn run(&self, tasks: &Receiver<Task>) {
        for task in tasks {
            match task {
                Task::Finalize { queue, epoch } => {
                    let finalized = self.process(queue);
                    crate::tracing::internal::log_finalizers_done(epoch, finalized);
                    (self.on_done)(epoch, finalized);
                }
                Task::Shutdown => break,
            }
        }
    }
}

/// Owner of the finalizer thread.
pub struct FinalizerProcessor {
    inner: Arc<Inner>,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    /// Create a processor; the thread starts on demand.
    #[must_use]
    pub fn new(ctx: Arc<MemoryContext>, on_done: FinalizersDone) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                ctx,
                on_done,
                running: AtomicBool::new(false),
            }),
            tx,
            rx,
            thread: Mutex::new(None),
        }
    }

    /// Take ownership of `queue`, produced by the collection of `epoch`.
    pub fn schedule_tasks(&self, queue: FinalizerQueue, epoch: u64) {
        let mut thread = self.thread.lock();
        if queue.is_empty() && thread.is_none() {
            (self.inner.on_done)(epoch, 0);
            return;
        }
        self.start_locked(&mut thread);
        let _ = self.tx.send(Task::Finalize { queue, epoch });
    }

    /// Start the thread unless it runs already.
    pub fn start_if_needed(&self) {
        self.start_locked(&mut self.thread.lock());
    }

    fn start_locked(&self, thread: &mut Option<JoinHandle<()>>) {
        if thread.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let rx = self.rx.clone();
        inner.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || {
                crate::tracing::internal::log_thread_lifecycle(THREAD_NAME, true);
                inner.run(&rx);
                inner.running.store(false, Ordering::Release);
                crate::tracing::internal::log_thread_lifecycle(THREAD_NAME, false);
            });
        match spawned {
            Ok(handle) => *thread = Some(handle),
            Err(err) => crate::error::fatal(format_args!("cannot spawn {THREAD_NAME}: {err}")),
        }
    }

    /// Drain every scheduled queue, then stop the thread.
    pub fn stop_if_running(&self) {
        let mut thread = self.thread.lock();
        if let Some(handle) = thread.take() {
            let _ = self.tx.send(Task::Shutdown);
            let _ = handle.join();
        }
    }

    /// Whether the thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FinalizerProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerProcessor")
            .field("running", &self.is_running())
            .field("pending", &self.rx.len())
            .finish_non_exhaustive()
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_if_running();
    }
}

#[cfg(test)]
mod tests {
    use super::FinalizerProcessor;
    use crate::context::MemoryContext;
    use crate::gc::mark_sweep::{sweep_extra_objects, sweep_store};
    use crate::gc::cms::IntrusiveMarking;
    use crate::heap::FinalizerQueue;
    use crate::object::{ObjRef, TypeInfo, WORD};
    use crossbeam::channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    fn count(object: ObjRef) {
        // The payload is still readable while the finalizer runs.
        let value = unsafe { object.payload().cast::<usize>().read() };
        FINALIZED.fetch_add(value, Ordering::SeqCst);
    }

    static COUNTED: TypeInfo = TypeInfo::object("Counted", WORD, &[]).with_finalizer(count);

    fn processor(ctx: &Arc<MemoryContext>) -> (FinalizerProcessor, channel::Receiver<(u64, usize)>) {
        let (tx, rx) = channel::unbounded();
        let processor = FinalizerProcessor::new(
            Arc::clone(ctx),
            Box::new(move |epoch, n| {
                let _ = tx.send((epoch, n));
            }),
        );
        (processor, rx)
    }

    #[test]
    fn test_empty_queue_reports_immediately() {
        let ctx = Arc::new(MemoryContext::new(None));
        let (processor, done) = processor(&ctx);
        processor.schedule_tasks(FinalizerQueue::new(), 7);
        assert_eq!(done.try_recv().unwrap(), (7, 0));
        assert!(!processor.is_running());
    }

    #[test]
    fn test_runs_finalizers_then_frees() {
        let ctx = Arc::new(MemoryContext::new(None));
        for value in [3_usize, 4] {
            let object = ctx.allocate_published(&COUNTED, 0);
            unsafe { object.payload().cast::<usize>().write(value) };
        }
        let policy = IntrusiveMarking;
        sweep_extra_objects(&policy, ctx.extra_objects());
        let (queue, stats) = sweep_store(&policy, &ctx);
        assert_eq!(stats.finalizable, 2);
        assert_eq!(ctx.allocator().allocated_objects(), 2);

        let (processor, done) = processor(&ctx);
        processor.schedule_tasks(queue, 1);
        assert_eq!(done.recv().unwrap(), (1, 2));
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 7);
        assert_eq!(ctx.allocator().allocated_objects(), 0);
        assert!(processor.is_running());

        processor.stop_if_running();
        assert!(!processor.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let ctx = Arc::new(MemoryContext::new(None));
        let (processor, done) = processor(&ctx);
        processor.start_if_needed();
        assert!(processor.is_running());
        processor.stop_if_running();
        assert!(!processor.is_running());

        processor.start_if_needed();
        processor.schedule_tasks(FinalizerQueue::new(), 2);
        assert_eq!(done.recv().unwrap(), (2, 0));
        processor.stop_if_running();
    }
}
