//! GC metrics and statistics.

use std::collections::VecDeque;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counters produced by a marking pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Number of heap objects found alive.
    pub alive_heap_set: usize,
    /// Allocated bytes of the alive heap objects.
    pub alive_heap_set_bytes: usize,
    /// Number of roots that led into the graph.
    pub root_set_size: usize,
}

impl MarkStats {
    /// Add the counters of another pass.
    pub const fn merge(&mut self, other: Self) {
        self.alive_heap_set += other.alive_heap_set;
        self.alive_heap_set_bytes += other.alive_heap_set_bytes;
        self.root_set_size += other.root_set_size;
    }
}

impl Add for MarkStats {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self.merge(rhs);
        self
    }
}

impl AddAssign for MarkStats {
    fn add_assign(&mut self, rhs: Self) {
        self.merge(rhs);
    }
}

/// Root counts by source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootSetStatistics {
    /// Roots held in thread-local slots.
    pub thread_local_references: usize,
    /// Roots on shadow stacks.
    pub stack_references: usize,
    /// Roots held in global slots.
    pub global_references: usize,
    /// Stable (externally pinned) references.
    pub stable_references: usize,
}

impl RootSetStatistics {
    /// Sum over every source.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.thread_local_references
            + self.stack_references
            + self.global_references
            + self.stable_references
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Objects that survived.
    pub kept: usize,
    /// Objects erased immediately.
    pub swept: usize,
    /// Bytes returned to the allocator by erased objects.
    pub swept_bytes: usize,
    /// Objects moved to the finalizer queue.
    pub finalizable: usize,
}

/// Size of the live heap at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Live heap objects.
    pub objects_count: usize,
    /// Live payload bytes.
    pub total_objects_size_bytes: usize,
}

/// Timeline and results of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcInfo {
    /// Epoch this collection completes.
    pub epoch: u64,
    /// When the collection started.
    pub start_time: Instant,
    /// When the sweep finished.
    pub end_time: Option<Instant>,
    /// When mutators were asked to stop.
    pub pause_start_time: Option<Instant>,
    /// When mutators were resumed.
    pub pause_end_time: Option<Instant>,
    /// When the finalizer queue of this collection was drained.
    pub finalizers_done_time: Option<Instant>,
    /// Root counts by source.
    pub root_set: Option<RootSetStatistics>,
    /// Marking results.
    pub mark_stats: Option<MarkStats>,
    /// Sweep results.
    pub sweep_stats: Option<SweepStats>,
    /// Heap before the collection.
    pub memory_usage_before: Option<MemoryUsage>,
    /// Heap after the sweep (finalizable objects still included).
    pub memory_usage_after: Option<MemoryUsage>,
}

impl GcInfo {
    fn new(epoch: u64, start_time: Instant) -> Self {
        Self {
            epoch,
            start_time,
            end_time: None,
            pause_start_time: None,
            pause_end_time: None,
            finalizers_done_time: None,
            root_set: None,
            mark_stats: None,
            sweep_stats: None,
            memory_usage_before: None,
            memory_usage_after: None,
        }
    }

    /// Time from start to the end of the sweep.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Length of the stop-the-world window.
    #[must_use]
    pub fn pause_duration(&self) -> Option<Duration> {
        match (self.pause_start_time, self.pause_end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Time from start until the finalizers of this collection ran.
    #[must_use]
    pub fn duration_with_finalizers(&self) -> Option<Duration> {
        self.finalizers_done_time.map(|done| done - self.start_time)
    }
}

/// Measures how long a phase takes.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    start: Instant,
}

impl PhaseTimer {
    /// Start timing.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since [`start`](Self::start).
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Default number of collections kept in [`GcHistory`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// Ring buffer of recent collections.
#[derive(Debug)]
pub struct GcHistory {
    entries: Mutex<VecDeque<GcInfo>>,
    capacity: usize,
}

impl GcHistory {
    /// Create a history keeping at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, info: GcInfo) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(info);
    }

    fn update(&self, epoch: u64, f: impl FnOnce(&mut GcInfo)) {
        if let Some(info) = self.entries.lock().iter_mut().rev().find(|i| i.epoch == epoch) {
            f(info);
        }
    }

    /// Most recent `n` collections, newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcInfo> {
        self.entries.lock().iter().rev().take(n).copied().collect()
    }

    /// Number of recorded collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Average stop-the-world pause over the recorded collections.
    #[must_use]
    pub fn average_pause(&self) -> Duration {
        let entries = self.entries.lock();
        let pauses: Vec<Duration> = entries.iter().filter_map(GcInfo::pause_duration).collect();
        if pauses.is_empty() {
            return Duration::ZERO;
        }
        let count = u32::try_from(pauses.len()).unwrap_or(u32::MAX);
        pauses.iter().sum::<Duration>() / count
    }

    /// Longest stop-the-world pause over the recorded collections.
    #[must_use]
    pub fn max_pause(&self) -> Duration {
        self.entries
            .lock()
            .iter()
            .filter_map(GcInfo::pause_duration)
            .max()
            .unwrap_or_default()
    }
}

/// Statistics owned by a collector.
#[derive(Debug)]
pub struct GcStatistics {
    running: Mutex<Option<GcInfo>>,
    last: Mutex<Option<GcInfo>>,
    history: GcHistory,
    total_collections: AtomicUsize,
    total_objects_swept: AtomicUsize,
    total_bytes_swept: AtomicUsize,
    total_objects_finalized: AtomicUsize,
    total_pause_nanos: AtomicU64,
}

impl GcStatistics {
    /// Create empty statistics.
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self {
            running: Mutex::new(None),
            last: Mutex::new(None),
            history: GcHistory::new(history_capacity),
            total_collections: AtomicUsize::new(0),
            total_objects_swept: AtomicUsize::new(0),
            total_bytes_swept: AtomicUsize::new(0),
            total_objects_finalized: AtomicUsize::new(0),
            total_pause_nanos: AtomicU64::new(0),
        }
    }

    fn with_running(&self, f: impl FnOnce(&mut GcInfo)) {
        if let Some(info) = self.running.lock().as_mut() {
            f(info);
        }
    }

    pub(crate) fn on_start(&self, epoch: u64, usage: MemoryUsage) {
        let mut info = GcInfo::new(epoch, Instant::now());
        info.memory_usage_before = Some(usage);
        *self.running.lock() = Some(info);
    }

    pub(crate) fn on_pause_start(&self) {
        self.with_running(|info| info.pause_start_time = Some(Instant::now()));
    }

    pub(crate) fn on_pause_end(&self) {
        self.with_running(|info| info.pause_end_time = Some(Instant::now()));
    }

    pub(crate) fn on_root_set(&self, roots: RootSetStatistics) {
        self.with_running(|info| info.root_set = Some(roots));
    }

    pub(crate) fn on_mark(&self, stats: MarkStats) {
        self.with_running(|info| info.mark_stats = Some(stats));
    }

    pub(crate) fn on_sweep(&self, stats: SweepStats) {
        self.total_objects_swept.fetch_add(stats.swept, Ordering::Relaxed);
        self.total_bytes_swept.fetch_add(stats.swept_bytes, Ordering::Relaxed);
        self.with_running(|info| info.sweep_stats = Some(stats));
    }

    /// Close the running record; returns it.
    pub(crate) fn on_finish(&self, usage: MemoryUsage) -> Option<GcInfo> {
        let mut info = self.running.lock().take()?;
        info.end_time = Some(Instant::now());
        info.memory_usage_after = Some(usage);
        if let Some(pause) = info.pause_duration() {
            let nanos = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
            self.total_pause_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
        self.total_collections.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some(info);
        self.history.push(info);
        Some(info)
    }

    pub(crate) fn on_finalizers_done(&self, epoch: u64, finalized: usize) {
        let now = Instant::now();
        self.total_objects_finalized.fetch_add(finalized, Ordering::Relaxed);
        if let Some(info) = self.last.lock().as_mut().filter(|i| i.epoch == epoch) {
            info.finalizers_done_time = Some(now);
        }
        self.history
            .update(epoch, |info| info.finalizers_done_time = Some(now));
    }

    /// The collection in flight, if any.
    #[must_use]
    pub fn running_gc_info(&self) -> Option<GcInfo> {
        *self.running.lock()
    }

    /// The most recently completed collection.
    #[must_use]
    pub fn last_gc_info(&self) -> Option<GcInfo> {
        *self.last.lock()
    }

    /// Mark stats of the most recently completed collection.
    #[must_use]
    pub fn last_mark_stats(&self) -> Option<MarkStats> {
        self.last_gc_info().and_then(|info| info.mark_stats)
    }

    /// Sweep stats of the most recently completed collection.
    #[must_use]
    pub fn last_sweep_stats(&self) -> Option<SweepStats> {
        self.last_gc_info().and_then(|info| info.sweep_stats)
    }

    /// Recent collections.
    #[must_use]
    pub const fn history(&self) -> &GcHistory {
        &self.history
    }

    /// Completed collections.
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.total_collections.load(Ordering::Relaxed)
    }

    /// Objects erased by sweeps.
    #[must_use]
    pub fn total_objects_swept(&self) -> usize {
        self.total_objects_swept.load(Ordering::Relaxed)
    }

    /// Bytes returned by sweeps.
    #[must_use]
    pub fn total_bytes_swept(&self) -> usize {
        self.total_bytes_swept.load(Ordering::Relaxed)
    }

    /// Objects released by the finalizer processor.
    #[must_use]
    pub fn total_objects_finalized(&self) -> usize {
        self.total_objects_finalized.load(Ordering::Relaxed)
    }

    /// Accumulated stop-the-world time.
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.total_pause_nanos.load(Ordering::Relaxed))
    }
}
