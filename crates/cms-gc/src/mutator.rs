//! Thread-bound access to the heap.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::AllocError;
use crate::extra::{init_weak_counter, ForeignHandle, WEAK_REFERENCE_COUNTER};
use crate::object::{ObjRef, TypeInfo};
use crate::roots::RootSlot;
use crate::runtime::Runtime;
use crate::thread::{ThreadData, ThreadState};

/// A thread attached to a [`Runtime`].
///
/// Objects returned by the allocation methods are only guaranteed to survive
/// until the next safepoint (the next allocation, [`safe_point`](Self::safe_point)
/// or collection request) unless they are rooted or reachable from a root.
///
/// Fields of an object must not be overwritten while a collection marks, since
/// marking runs without a write barrier. Initialise fresh objects before
/// linking them into the graph.
pub struct Mutator {
    runtime: Runtime,
    thread: Arc<ThreadData>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn attach(runtime: Runtime) -> Self {
        let ctx = runtime.context();
        let thread = ctx.threads().register();
        thread.set_state(ThreadState::Runnable, ctx.threads().suspension());
        Self {
            runtime,
            thread,
            _not_send: PhantomData,
        }
    }

    /// The runtime this thread is attached to.
    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Collector bookkeeping of this thread.
    #[must_use]
    pub fn thread_data(&self) -> &ThreadData {
        &self.thread
    }

    /// Allocate a zeroed object.
    ///
    /// # Errors
    ///
    /// Fails if the heap limit is still exceeded after a full collection, or
    /// if the system allocator fails.
    pub fn allocate(&self, type_info: &'static TypeInfo) -> Result<ObjRef, AllocError> {
        self.allocate_array(type_info, 0)
    }

    /// Allocate a zeroed array with `len` elements. `len` is ignored for
    /// non-array types.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Self::allocate); additionally fails with
    /// [`AllocError::SizeOverflow`] if the size does not fit in `usize`.
    pub fn allocate_array(&self, type_info: &'static TypeInfo, len: usize) -> Result<ObjRef, AllocError> {
        let size = type_info
            .payload_size(len)
            .ok_or(AllocError::SizeOverflow)?;
        let gc = self.runtime.gc();
        let allocator = self.runtime.context().allocator();
        gc.safe_point_allocation(&self.thread, size);
        let node = match allocator.allocate(type_info, len) {
            Ok(node) => node,
            Err(AllocError::SizeOverflow) => return Err(AllocError::SizeOverflow),
            Err(_) => {
                gc.on_oom(&self.thread, size);
                allocator.allocate(type_info, len)?
            }
        };
        self.thread.push_allocated(node);
        Ok(node.object())
    }

    /// Push a root onto the shadow stack; returns its slot index.
    pub fn push_root(&self, root: Option<ObjRef>) -> usize {
        self.thread.shadow_stack().push(root)
    }

    /// Pop the most recent root.
    pub fn pop_root(&self) -> Option<ObjRef> {
        self.thread.shadow_stack().pop()
    }

    /// Overwrite the root at `index`.
    pub fn set_root(&self, index: usize, root: Option<ObjRef>) {
        self.thread.shadow_stack().set(index, root);
    }

    /// Read the root at `index`.
    #[must_use]
    pub fn root(&self, index: usize) -> Option<ObjRef> {
        self.thread.shadow_stack().get(index)
    }

    /// Open a frame; roots pushed until the guard drops are popped with it.
    #[must_use = "the frame closes when the guard is dropped"]
    pub fn root_scope(&self) -> RootScope<'_> {
        self.thread.shadow_stack().push_frame();
        RootScope { mutator: self }
    }

    /// Register a thread-local root slot, alive as long as this mutator.
    pub fn create_thread_local(&self, value: Option<ObjRef>) -> Arc<RootSlot> {
        let slot = Arc::new(RootSlot::new(value));
        self.thread.add_thread_local(Arc::clone(&slot));
        slot
    }

    /// Park here if a collection is stopping the world.
    pub fn safe_point(&self) {
        self.runtime.gc().on_suspend_for_gc(&self.thread);
    }

    /// Run a full collection and wait until it finished sweeping.
    pub fn collect(&self) -> u64 {
        self.runtime.gc().schedule_and_wait_full_gc(Some(&self.thread))
    }

    /// Run a full collection and wait until its finalizers ran.
    pub fn collect_with_finalizers(&self) -> u64 {
        self.runtime
            .gc()
            .schedule_and_wait_full_gc_with_finalizers(Some(&self.thread))
    }

    /// Run `f` in the native state. `f` must not touch the heap; collections
    /// proceed without waiting for this thread meanwhile.
    pub fn run_native<R>(&self, f: impl FnOnce() -> R) -> R {
        let suspension = self.runtime.context().threads().suspension();
        self.thread.set_state(ThreadState::Native, suspension);
        let result = f();
        self.thread.set_state(ThreadState::Runnable, suspension);
        result
    }

    /// Weak-reference counter of `object`, created on first use. Read it
    /// with [`weak_referent`](crate::extra::weak_referent).
    ///
    /// `object` must be a rooted heap object.
    ///
    /// # Errors
    ///
    /// Fails if the counter cell cannot be allocated.
    pub fn create_weak_reference(&self, object: ObjRef) -> Result<ObjRef, AllocError> {
        if let Some(counter) = object.extra_data().and_then(|extra| extra.weak_counter()) {
            return Ok(counter);
        }
        let counter = self.allocate(&WEAK_REFERENCE_COUNTER)?;
        init_weak_counter(counter, object);
        let record = self.runtime.context().extra_objects().install(object);
        Ok(record.install_weak_counter(counter))
    }

    /// Attach a foreign handle to a heap object; it is dropped once the
    /// object is collected. Returns the handle it replaces.
    pub fn attach_foreign_handle(&self, object: ObjRef, handle: ForeignHandle) -> Option<ForeignHandle> {
        self.runtime
            .context()
            .extra_objects()
            .install(object)
            .set_associated_object(handle)
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let ctx = self.runtime.context();
        self.thread
            .set_state(ThreadState::Native, ctx.threads().suspension());
        ctx.threads().unregister(&self.thread, ctx.objects());
    }
}

/// Shadow-stack frame opened by [`Mutator::root_scope`].
#[derive(Debug)]
pub struct RootScope<'m> {
    mutator: &'m Mutator,
}

impl RootScope<'_> {
    /// Push a root into this frame.
    pub fn push(&self, root: Option<ObjRef>) -> usize {
        self.mutator.push_root(root)
    }
}

impl Drop for RootScope<'_> {
    fn drop(&mut self) {
        self.mutator.thread.shadow_stack().pop_frame();
    }
}
