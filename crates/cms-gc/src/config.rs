//! Collector configuration.

use crate::metrics::DEFAULT_HISTORY_CAPACITY;

/// Default number of bytes allocated between automatic collections.
pub const DEFAULT_ALLOCATION_THRESHOLD: usize = 8 * 1024 * 1024;

/// Who runs a requested collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingBehavior {
    /// The dedicated collector thread.
    #[default]
    Dedicated,
    /// The requesting thread, synchronously. Makes tests deterministic.
    Inline,
}

/// Settings of a [`Runtime`](crate::Runtime).
///
/// ```
/// use cms_gc::{GcConfig, MarkingBehavior};
///
/// let config = GcConfig::default()
///     .with_marking_behavior(MarkingBehavior::Inline)
///     .with_allocation_threshold(None)
///     .with_max_heap_bytes(Some(1 << 20));
/// assert_eq!(config.max_heap_bytes, Some(1 << 20));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Who runs requested collections.
    pub marking_behavior: MarkingBehavior,
    /// Bytes allocated between automatic collections; `None` disables them.
    pub allocation_threshold: Option<usize>,
    /// Upper bound on live payload bytes; `None` is unbounded.
    pub max_heap_bytes: Option<usize>,
    /// Start the finalizer thread with the runtime instead of on first use.
    pub start_finalizer_thread: bool,
    /// Number of [`GcInfo`](crate::metrics::GcInfo) records kept.
    pub history_capacity: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            marking_behavior: MarkingBehavior::Dedicated,
            allocation_threshold: Some(DEFAULT_ALLOCATION_THRESHOLD),
            max_heap_bytes: None,
            start_finalizer_thread: false,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl GcConfig {
    /// Set [`marking_behavior`](Self::marking_behavior).
    #[must_use]
    pub const fn with_marking_behavior(mut self, behavior: MarkingBehavior) -> Self {
        self.marking_behavior = behavior;
        self
    }

    /// Set [`allocation_threshold`](Self::allocation_threshold).
    #[must_use]
    pub const fn with_allocation_threshold(mut self, threshold: Option<usize>) -> Self {
        self.allocation_threshold = threshold;
        self
    }

    /// Set [`max_heap_bytes`](Self::max_heap_bytes).
    #[must_use]
    pub const fn with_max_heap_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_heap_bytes = limit;
        self
    }

    /// Set [`start_finalizer_thread`](Self::start_finalizer_thread).
    #[must_use]
    pub const fn with_start_finalizer_thread(mut self, start: bool) -> Self {
        self.start_finalizer_thread = start;
        self
    }

    /// Set [`history_capacity`](Self::history_capacity).
    #[must_use]
    pub const fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
