//! Per-thread collector state.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::gc::scheduler::SchedulerThreadData;

/// Collector bookkeeping kept for every mutator.
#[derive(Debug, Default)]
pub struct GcThreadData {
    marking: AtomicBool,
    scheduler: SchedulerThreadData,
}

impl GcThreadData {
    /// Fresh state: not participating in any collection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            marking: AtomicBool::new(false),
            scheduler: SchedulerThreadData::new(),
        }
    }

    /// Whether the in-flight collection still expects this thread's roots.
    #[must_use]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    /// Enlist the thread in a collection that is about to stop the world.
    pub(crate) fn set_marking(&self) {
        self.marking.store(true, Ordering::Release);
    }

    /// The thread's roots were collected.
    pub(crate) fn clear_marking(&self) {
        self.marking.store(false, Ordering::Release);
    }

    /// Allocation bookkeeping for the scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &SchedulerThreadData {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::GcThreadData;

    #[test]
    fn test_marking_flag() {
        let data = GcThreadData::new();
        assert!(!data.is_marking());
        data.set_marking();
        assert!(data.is_marking());
        data.clear_marking();
        assert!(!data.is_marking());
    }

    #[test]
    fn test_scheduler_data_is_per_thread() {
        let a = GcThreadData::new();
        let b = GcThreadData::new();
        a.scheduler().record(10);
        assert_eq!(a.scheduler().allocated_bytes(), 10);
        assert_eq!(b.scheduler().allocated_bytes(), 0);
    }
}
