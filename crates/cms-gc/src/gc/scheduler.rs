//! Collection scheduling.
//!
//! The scheduler decides *when* a collection should start. The collector asks
//! it on every allocation and reports back when a collection was requested
//! and when one finished.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::metrics::GcInfo;

/// Per-thread allocation bookkeeping owned by the scheduler.
#[derive(Debug, Default)]
pub struct SchedulerThreadData {
    allocated_bytes: AtomicUsize,
}

impl SchedulerThreadData {
    /// Create empty bookkeeping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes allocated by the thread since the last flush.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Account `size` bytes; returns the unflushed total.
    pub fn record(&self, size: usize) -> usize {
        self.allocated_bytes.fetch_add(size, Ordering::Relaxed) + size
    }

    /// Take the unflushed total, resetting it to zero.
    pub fn take(&self) -> usize {
        self.allocated_bytes.swap(0, Ordering::Relaxed)
    }
}

/// Policy deciding when to collect.
pub trait GcScheduler: Send + Sync + fmt::Debug {
    /// Called on every allocation of `size` bytes by a mutator. Returning
    /// `true` requests a collection.
    fn on_safe_point_allocation(&self, thread: &SchedulerThreadData, size: usize) -> bool;

    /// A collection was requested and mutators are being suspended.
    fn on_collection_requested(&self) {}

    /// A collection finished sweeping.
    fn on_collection_finished(&self, _info: &GcInfo) {}
}

/// Largest amount a thread accumulates locally before flushing to the
/// global counter.
const LOCAL_FLUSH_BYTES: usize = 16 * 1024;

/// Requests a collection every `threshold` allocated bytes.
#[derive(Debug)]
pub struct ThresholdScheduler {
    threshold: Option<usize>,
    flush_bytes: usize,
    allocated_since_gc: AtomicUsize,
}

impl ThresholdScheduler {
    /// Create a scheduler; `None` never requests a collection.
    #[must_use]
    pub fn new(threshold: Option<usize>) -> Self {
        let flush_bytes = threshold.map_or(LOCAL_FLUSH_BYTES, |t| t.clamp(1, LOCAL_FLUSH_BYTES));
        Self {
            threshold,
            flush_bytes,
            allocated_since_gc: AtomicUsize::new(0),
        }
    }

    /// Bytes flushed since the last finished collection.
    #[must_use]
    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc.load(Ordering::Relaxed)
    }
}

impl GcScheduler for ThresholdScheduler {
    fn on_safe_point_allocation(&self, thread: &SchedulerThreadData, size: usize) -> bool {
        let Some(threshold) = self.threshold else {
            return false;
        };
        if thread.record(size) < self.flush_bytes {
            return false;
        }
        let flushed = thread.take();
        let total = self.allocated_since_gc.fetch_add(flushed, Ordering::Relaxed) + flushed;
        total >= threshold
    }

    fn on_collection_finished(&self, _info: &GcInfo) {
        self.allocated_since_gc.store(0, Ordering::Relaxed);
    }
}
