//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collections. Without the feature every helper is a
//! no-op with the same signature, so call sites need no `cfg`.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::time::Duration;

    use tracing::{span, Level};

    use crate::metrics::{MarkStats, RootSetStatistics, SweepStats};

    /// Collection phases that get their own span.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Stop-the-world root-set collection.
        RootSet,
        /// Concurrent marking.
        Mark,
        /// Concurrent sweeping.
        Sweep,
    }

    /// Span covering one whole collection.
    pub fn trace_gc_collection(epoch: u64) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", epoch).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Roots contributed by one mutator.
    pub fn log_thread_root_set(thread_id: u64, stack: usize, thread_local: usize) {
        tracing::trace!(thread_id, stack, thread_local, "thread_root_set");
    }

    /// Global and stable-reference roots.
    pub fn log_global_root_set(global: usize, stable: usize) {
        tracing::trace!(global, stable, "global_root_set");
    }

    /// Root-set breakdown by source.
    pub fn log_root_set(stats: &RootSetStatistics) {
        tracing::debug!(
            stack = stats.stack_references,
            thread_local = stats.thread_local_references,
            global = stats.global_references,
            stable = stats.stable_references,
            total = stats.total(),
            "root_set_collected"
        );
    }

    /// End of marking.
    pub fn log_mark_finished(stats: &MarkStats, elapsed: Duration) {
        tracing::debug!(
            alive_objects = stats.alive_heap_set,
            alive_bytes = stats.alive_heap_set_bytes,
            roots = stats.root_set_size,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "mark_finished"
        );
    }

    /// End of sweeping.
    pub fn log_sweep_finished(stats: &SweepStats, elapsed: Duration) {
        tracing::debug!(
            kept = stats.kept,
            swept = stats.swept,
            swept_bytes = stats.swept_bytes,
            finalizable = stats.finalizable,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "sweep_finished"
        );
    }

    /// Another collector already stopped the world.
    pub fn log_suspension_lost(epoch: u64) {
        tracing::debug!(epoch, "suspension_race_lost");
    }

    /// Stop-the-world window closed.
    pub fn log_pause(epoch: u64, pause: Duration) {
        tracing::debug!(
            epoch,
            pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX),
            "mutators_resumed"
        );
    }

    /// An allocation failed and a synchronous collection is forced.
    pub fn log_out_of_memory(thread_id: u64, requested: usize) {
        tracing::warn!(thread_id, requested, "allocation_failed_collecting");
    }

    /// A finalizer queue was drained.
    pub fn log_finalizers_done(epoch: u64, finalized: usize) {
        tracing::debug!(epoch, finalized, "finalizers_done");
    }

    /// A helper thread started or stopped.
    pub fn log_thread_lifecycle(name: &str, running: bool) {
        tracing::debug!(name, running, "gc_thread_lifecycle");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use std::time::Duration;

    use crate::metrics::{MarkStats, RootSetStatistics, SweepStats};

    /// Collection phases that get their own span.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Stop-the-world root-set collection.
        RootSet,
        /// Concurrent marking.
        Mark,
        /// Concurrent sweeping.
        Sweep,
    }

    /// Stub when tracing is disabled.
    pub fn trace_gc_collection(_epoch: u64) {}

    /// Stub when tracing is disabled.
    pub fn trace_phase(_phase: GcPhase) {}

    /// Stub when tracing is disabled.
    pub fn log_thread_root_set(_thread_id: u64, _stack: usize, _thread_local: usize) {}

    /// Stub when tracing is disabled.
    pub fn log_global_root_set(_global: usize, _stable: usize) {}

    /// Stub when tracing is disabled.
    pub fn log_root_set(_stats: &RootSetStatistics) {}

    /// Stub when tracing is disabled.
    pub fn log_mark_finished(_stats: &MarkStats, _elapsed: Duration) {}

    /// Stub when tracing is disabled.
    pub fn log_sweep_finished(_stats: &SweepStats, _elapsed: Duration) {}

    /// Stub when tracing is disabled.
    pub fn log_suspension_lost(_epoch: u64) {}

    /// Stub when tracing is disabled.
    pub fn log_pause(_epoch: u64, _pause: Duration) {}

    /// Stub when tracing is disabled.
    pub fn log_out_of_memory(_thread_id: u64, _requested: usize) {}

    /// Stub when tracing is disabled.
    pub fn log_finalizers_done(_epoch: u64, _finalized: usize) {}

    /// Stub when tracing is disabled.
    pub fn log_thread_lifecycle(_name: &str, _running: bool) {}
}

pub use internal::GcPhase;
