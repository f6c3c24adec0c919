//! The runtime: one heap, one collector, any number of mutators.

use std::fmt;
use std::sync::Arc;

use crate::config::GcConfig;
use crate::context::MemoryContext;
use crate::gc::cms::ConcurrentMarkAndSweep;
use crate::gc::scheduler::{GcScheduler, ThresholdScheduler};
use crate::metrics::GcStatistics;
use crate::mutator::Mutator;
use crate::object::ObjRef;
use crate::roots::{GlobalRoot, StableRef};

struct RuntimeInner {
    // Dropped first: stops the collector and drains the finalizers while the
    // heap is still alive.
    gc: ConcurrentMarkAndSweep,
    ctx: Arc<MemoryContext>,
}

/// Shared handle to a garbage-collected heap and its collector.
///
/// Cloning is cheap. The collector and finalizer threads stop, and every
/// remaining object is released, when the last handle and the last
/// [`Mutator`] are gone.
///
/// ```
/// use cms_gc::{GcConfig, MarkingBehavior, Runtime, TypeInfo, WORD};
///
/// static CELL: TypeInfo = TypeInfo::object("Cell", WORD, &[0]);
///
/// let runtime = Runtime::new(GcConfig::default().with_marking_behavior(MarkingBehavior::Inline));
/// let mutator = runtime.attach_thread();
/// let cell = mutator.allocate(&CELL).unwrap();
/// let global = runtime.create_global(Some(cell));
/// mutator.collect();
/// assert_eq!(runtime.statistics().total_collections(), 1);
/// assert_eq!(global.get(), Some(cell));
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the threshold scheduler of `config`.
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        let scheduler = ThresholdScheduler::new(config.allocation_threshold);
        Self::with_scheduler(config, Box::new(scheduler))
    }

    /// Create a runtime with a custom scheduler.
    #[must_use]
    pub fn with_scheduler(config: GcConfig, scheduler: Box<dyn GcScheduler>) -> Self {
        let ctx = Arc::new(MemoryContext::new(config.max_heap_bytes));
        let gc = ConcurrentMarkAndSweep::new(Arc::clone(&ctx), &config, scheduler);
        Self {
            inner: Arc::new(RuntimeInner { gc, ctx }),
        }
    }

    /// Register the current thread as a mutator.
    #[must_use]
    pub fn attach_thread(&self) -> Mutator {
        Mutator::attach(self.clone())
    }

    /// Heap, stores and registries.
    #[must_use]
    pub fn context(&self) -> &MemoryContext {
        &self.inner.ctx
    }

    /// The collector.
    #[must_use]
    pub fn gc(&self) -> &ConcurrentMarkAndSweep {
        &self.inner.gc
    }

    /// Collection statistics.
    #[must_use]
    pub fn statistics(&self) -> &GcStatistics {
        self.inner.gc.statistics()
    }

    /// Number of completed collections.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.gc.epoch()
    }

    /// Register a global root slot. It stops being a root once every clone
    /// of the returned handle was dropped.
    pub fn create_global(&self, value: Option<ObjRef>) -> GlobalRoot {
        self.inner.ctx.globals().register(value)
    }

    /// Pin `object` until [`dispose_stable_ref`](Self::dispose_stable_ref).
    pub fn create_stable_ref(&self, object: ObjRef) -> StableRef {
        self.inner.ctx.stable_refs().create(object)
    }

    /// Unpin a stable reference.
    pub fn dispose_stable_ref(&self, stable: StableRef) {
        self.inner.ctx.stable_refs().dispose(stable);
    }

    /// Run a full collection and wait for it.
    ///
    /// For threads without a [`Mutator`]; an attached thread calls
    /// [`Mutator::collect`] so the collector does not wait for it.
    pub fn collect(&self) -> u64 {
        self.inner.gc.schedule_and_wait_full_gc(None)
    }

    /// Run a full collection and wait for its finalizers.
    pub fn collect_with_finalizers(&self) -> u64 {
        self.inner.gc.schedule_and_wait_full_gc_with_finalizers(None)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("epoch", &self.epoch())
            .field("objects", &self.inner.ctx.objects().len())
            .field("mutators", &self.inner.ctx.threads().len())
            .finish_non_exhaustive()
    }
}
