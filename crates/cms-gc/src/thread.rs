//! Mutator threads and stop-the-world coordination.
//!
//! A mutator is either `Runnable` (running managed code, must reach a
//! safepoint before the collector may look at its roots) or `Native` (blocked
//! or running code that does not touch the heap; its roots are stable).
//!
//! Suspension works in three steps:
//!
//! 1. The collector wins [`ThreadSuspension::request_threads_suspension`].
//! 2. Each runnable mutator notices the request at its next safepoint,
//!    acknowledges it and blocks on its own resume channel.
//! 3. After collecting roots the collector calls
//!    [`ThreadSuspension::resume_threads`], which clears the request and
//!    sends exactly one resume message to every acknowledged thread.
//!
//! A thread that acknowledges after the request was already cleared takes
//! its acknowledgement back instead of waiting, so no resume is ever lost.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::gc::thread_data::GcThreadData;
use crate::heap::{NodePtr, ObjectStore};
use crate::object::ObjRef;
use crate::roots::{RootSlot, ShadowStack};

/// Execution state of a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Running managed code.
    Runnable = 0,
    /// Not touching the managed heap.
    Native = 1,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        if value == Self::Runnable as u8 {
            Self::Runnable
        } else {
            Self::Native
        }
    }
}

/// Where a thread root came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRootSource {
    /// A shadow stack slot.
    Stack,
    /// A thread-local slot.
    ThreadLocal,
}

// ============================================================================
// ThreadData
// ============================================================================

/// Everything the collector knows about one mutator.
pub struct ThreadData {
    id: u64,
    state: AtomicU8,
    suspended: AtomicBool,
    resume_tx: Sender<()>,
    resume_rx: Receiver<()>,
    stack: Mutex<ShadowStack>,
    thread_locals: Mutex<Vec<Arc<RootSlot>>>,
    producer: Mutex<Vec<NodePtr>>,
    gc: GcThreadData,
}

impl ThreadData {
    fn new(id: u64) -> Self {
        let (resume_tx, resume_rx) = channel::bounded(1);
        Self {
            id,
            state: AtomicU8::new(ThreadState::Native as u8),
            suspended: AtomicBool::new(false),
            resume_tx,
            resume_rx,
            stack: Mutex::new(ShadowStack::new()),
            thread_locals: Mutex::new(Vec::new()),
            producer: Mutex::new(Vec::new()),
            gc: GcThreadData::new(),
        }
    }

    /// Registry-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current execution state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the thread acknowledged a suspension request and is parked.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Whether the collector may read this thread's roots.
    #[must_use]
    pub fn is_safe_for_gc(&self) -> bool {
        self.is_suspended() || self.state() == ThreadState::Native
    }

    /// Collector state of this thread.
    #[must_use]
    pub const fn gc(&self) -> &GcThreadData {
        &self.gc
    }

    /// Lock the shadow stack.
    pub fn shadow_stack(&self) -> MutexGuard<'_, ShadowStack> {
        self.stack.lock()
    }

    /// Register a thread-local root slot.
    pub fn add_thread_local(&self, slot: Arc<RootSlot>) {
        self.thread_locals.lock().push(slot);
    }

    /// Number of objects allocated since the thread was last published.
    #[must_use]
    pub fn unpublished_objects(&self) -> usize {
        self.producer.lock().len()
    }

    pub(crate) fn push_allocated(&self, node: NodePtr) {
        self.producer.lock().push(node);
    }

    /// Make the thread's fresh allocations visible to the collector.
    pub(crate) fn publish(&self, store: &ObjectStore) {
        let mut producer = self.producer.lock();
        store.publish(&mut producer);
    }

    pub(crate) fn take_unpublished(&self) -> Vec<NodePtr> {
        mem::take(&mut *self.producer.lock())
    }

    /// Call `f` for every stack and thread-local root slot.
    pub fn for_each_root(&self, mut f: impl FnMut(ThreadRootSource, Option<ObjRef>)) {
        for root in self.stack.lock().iter() {
            f(ThreadRootSource::Stack, root);
        }
        for slot in self.thread_locals.lock().iter() {
            f(ThreadRootSource::ThreadLocal, slot.get());
        }
    }

    pub(crate) fn set_state(&self, state: ThreadState, suspension: &ThreadSuspension) {
        self.state.store(state as u8, Ordering::SeqCst);
        match state {
            ThreadState::Native => suspension.notify_progress(),
            ThreadState::Runnable => {
                self.suspend_if_requested(suspension);
            }
        }
    }

    /// Park the thread if a suspension is requested. Returns whether it parked.
    pub(crate) fn suspend_if_requested(&self, suspension: &ThreadSuspension) -> bool {
        if !suspension.is_requested() {
            return false;
        }
        self.suspended.store(true, Ordering::SeqCst);
        suspension.notify_progress();
        if !suspension.is_requested() && self.suspended.swap(false, Ordering::SeqCst) {
            // The collector resumed before seeing our acknowledgement.
            return true;
        }
        // A resume message is sent exactly once for a consumed acknowledgement.
        let _ = self.resume_rx.recv();
        true
    }

    fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            let _ = self.resume_tx.send(());
        }
    }
}

impl fmt::Debug for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadData")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("suspended", &self.is_suspended())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ThreadSuspension
// ============================================================================

/// How long the collector sleeps between re-checks while waiting for threads.
const SUSPENSION_POLL: Duration = Duration::from_millis(1);

/// Global half of the stop-the-world protocol.
#[derive(Debug, Default)]
pub struct ThreadSuspension {
    requested: AtomicBool,
    lock: Mutex<()>,
    progress: Condvar,
}

impl ThreadSuspension {
    /// Ask every mutator to stop. Returns `false` if another collector already
    /// holds the world stopped.
    pub fn request_threads_suspension(&self) -> bool {
        self.requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether a suspension is in effect.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn notify_progress(&self) {
        let _guard = self.lock.lock();
        self.progress.notify_all();
    }

    /// Block until every registered thread accepted by `filter` is suspended
    /// or native.
    pub fn wait_for_threads_suspension<F>(&self, registry: &ThreadRegistry, mut filter: F)
    where
        F: FnMut(&ThreadData) -> bool,
    {
        let mut guard = self.lock.lock();
        loop {
            let ready = registry
                .lock_for_iter()
                .iter()
                .filter(|t| filter(t))
                .all(|t| t.is_safe_for_gc());
            if ready {
                return;
            }
            let _ = self.progress.wait_for(&mut guard, SUSPENSION_POLL);
        }
    }

    /// Lift the suspension and wake every parked thread.
    pub fn resume_threads(&self, registry: &ThreadRegistry) {
        self.requested.store(false, Ordering::SeqCst);
        for thread in registry.lock_for_iter().iter() {
            thread.resume();
        }
    }
}

// ============================================================================
// ThreadRegistry
// ============================================================================

/// All registered mutators.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadData>>>,
    next_id: AtomicU64,
    suspension: ThreadSuspension,
}

impl ThreadRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread. It starts out `Native`.
    pub(crate) fn register(&self) -> Arc<ThreadData> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(ThreadData::new(id));
        self.threads.lock().push(Arc::clone(&thread));
        thread
    }

    /// Remove a thread, handing its unpublished objects to `store`.
    pub(crate) fn unregister(&self, thread: &Arc<ThreadData>, store: &ObjectStore) {
        let mut threads = self.threads.lock();
        threads.retain(|t| !Arc::ptr_eq(t, thread));
        store.adopt_orphans(&mut thread.take_unpublished());
        drop(threads);
        self.suspension.notify_progress();
    }

    /// Lock the registry for iteration.
    pub fn lock_for_iter(&self) -> MutexGuard<'_, Vec<Arc<ThreadData>>> {
        self.threads.lock()
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no thread is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The stop-the-world coordinator.
    #[must_use]
    pub const fn suspension(&self) -> &ThreadSuspension {
        &self.suspension
    }
}

#[cfg(test)]
mod tests {
    use super::{ThreadRegistry, ThreadRootSource, ThreadState};
    use crate::heap::ObjectStore;
    use crate::object::{NonHeapObject, TypeInfo, WORD};
    use crate::roots::RootSlot;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    static LEAF: TypeInfo = TypeInfo::object("Leaf", WORD, &[]);

    #[test]
    fn test_register_and_unregister() {
        let registry = ThreadRegistry::new();
        let store = ObjectStore::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(a.state(), ThreadState::Native);
        registry.unregister(&a, &store);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_request_suspension_is_exclusive() {
        let registry = ThreadRegistry::new();
        let suspension = registry.suspension();
        assert!(suspension.request_threads_suspension());
        assert!(!suspension.request_threads_suspension());
        suspension.resume_threads(&registry);
        assert!(suspension.request_threads_suspension());
        suspension.resume_threads(&registry);
    }

    #[test]
    fn test_no_suspension_without_request() {
        let registry = ThreadRegistry::new();
        let thread = registry.register();
        thread.set_state(ThreadState::Runnable, registry.suspension());
        assert!(!thread.suspend_if_requested(registry.suspension()));
        assert!(!thread.is_suspended());
    }

    #[test]
    fn test_native_threads_do_not_block_suspension() {
        let registry = ThreadRegistry::new();
        let _thread = registry.register();
        let suspension = registry.suspension();
        assert!(suspension.request_threads_suspension());
        suspension.wait_for_threads_suspension(&registry, |_| true);
        suspension.resume_threads(&registry);
    }

    #[test]
    fn test_runnable_thread_parks_until_resumed() {
        let registry = Arc::new(ThreadRegistry::new());
        let thread = registry.register();
        thread.set_state(ThreadState::Runnable, registry.suspension());
        assert!(registry.suspension().request_threads_suspension());

        let resumed = Arc::new(AtomicBool::new(false));
        let mutator = {
            let registry = Arc::clone(&registry);
            let thread = Arc::clone(&thread);
            let resumed = Arc::clone(&resumed);
            thread::spawn(move || {
                assert!(thread.suspend_if_requested(registry.suspension()));
                resumed.store(true, Ordering::SeqCst);
            })
        };

        registry
            .suspension()
            .wait_for_threads_suspension(&registry, |_| true);
        assert!(thread.is_suspended());
        thread::sleep(Duration::from_millis(10));
        assert!(!resumed.load(Ordering::SeqCst));

        registry.suspension().resume_threads(&registry);
        mutator.join().unwrap();
        assert!(resumed.load(Ordering::SeqCst));
        assert!(!thread.is_suspended());
    }

    #[test]
    fn test_repeated_suspend_resume_cycles() {
        let registry = Arc::new(ThreadRegistry::new());
        let thread = registry.register();
        thread.set_state(ThreadState::Runnable, registry.suspension());
        let stop = Arc::new(AtomicBool::new(false));
        let mutator = {
            let registry = Arc::clone(&registry);
            let thread = Arc::clone(&thread);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread.suspend_if_requested(registry.suspension());
                }
                thread.set_state(ThreadState::Native, registry.suspension());
            })
        };
        for _ in 0..100 {
            assert!(registry.suspension().request_threads_suspension());
            registry
                .suspension()
                .wait_for_threads_suspension(&registry, |_| true);
            registry.suspension().resume_threads(&registry);
        }
        stop.store(true, Ordering::SeqCst);
        mutator.join().unwrap();
    }

    #[test]
    fn test_for_each_root_reports_sources() {
        let registry = ThreadRegistry::new();
        let thread = registry.register();
        let leaf = NonHeapObject::permanent(&LEAF);
        thread.shadow_stack().push(Some(leaf.as_ref()));
        thread.shadow_stack().push(None);
        thread.add_thread_local(Arc::new(RootSlot::new(Some(leaf.as_ref()))));

        let mut seen = Vec::new();
        thread.for_each_root(|source, root| seen.push((source, root.is_some())));
        assert_eq!(
            seen,
            vec![
                (ThreadRootSource::Stack, true),
                (ThreadRootSource::Stack, false),
                (ThreadRootSource::ThreadLocal, true),
            ]
        );
    }
}
