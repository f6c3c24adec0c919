//! # Lock Ordering Discipline
//!
//! The collector takes several locks while the world is stopped. They must
//! always be acquired in increasing level so that a mutator publishing its
//! state can never deadlock against the collector.
//!
//! | Level | Lock Type       | Description                                  |
//! |-------|-----------------|----------------------------------------------|
//! | 1     | `ThreadRegistry`| Registered mutator list                      |
//! | 2     | `ThreadLocal`   | A mutator's shadow stack, thread locals, producer list |
//! | 3     | `ObjectStore`   | Published objects                            |
//! | 3     | `ExtraObjects`  | Auxiliary records                            |
//! | 3     | `RootRegistry`  | Globals and stable references                |
//!
//! Same-level locks may be taken in any order relative to each other.
//!
//! In debug builds [`LockGuard::new`] validates the order against the locks
//! the current thread already announced; in release builds it compiles to
//! nothing.
//!
//! ```
//! use cms_gc::gc::sync::{LockGuard, LockOrder};
//!
//! let _registry = LockGuard::new(LockOrder::ThreadRegistry);
//! let _thread = LockGuard::new(LockOrder::ThreadLocal);
//! let _store = LockGuard::new(LockOrder::ObjectStore);
//! ```

#[cfg(debug_assertions)]
use std::cell::RefCell;

#[cfg(debug_assertions)]
use crate::gc_assert;

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Thread registry (level 1).
    ThreadRegistry = 1,
    /// Per-thread roots and producer list (level 2).
    ThreadLocal = 2,
    /// Object store (level 3).
    ObjectStore = 3,
    /// Auxiliary record store (level 3).
    ExtraObjects = 4,
    /// Global and stable-reference registries (level 3).
    RootRegistry = 5,
}

impl LockOrder {
    /// Unique value per tag.
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Acquisition level; locks must be taken in non-decreasing level.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::ThreadRegistry => 1,
            Self::ThreadLocal => 2,
            Self::ObjectStore | Self::ExtraObjects | Self::RootRegistry => 3,
        }
    }

    /// Whether this lock may be taken while holding locks up to level `held`.
    #[must_use]
    pub const fn may_follow(self, held: u8) -> bool {
        self.level() >= held
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LEVELS: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Highest lock level currently announced by this thread, or 0.
#[must_use]
pub fn held_level() -> u8 {
    #[cfg(debug_assertions)]
    {
        HELD_LEVELS
            .try_with(|held| held.borrow().iter().copied().max().unwrap_or(0))
            .unwrap_or(0)
    }
    #[cfg(not(debug_assertions))]
    {
        0
    }
}

/// RAII announcement of a lock acquisition.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Announce acquiring a lock with tag `tag`.
    ///
    /// In debug builds, aborts the process if a higher-level lock is already
    /// held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let held = held_level();
            gc_assert!(
                tag.may_follow(held),
                "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding level {held}",
                tag.level()
            );
            let _ = HELD_LEVELS.try_with(|levels| levels.borrow_mut().push(tag.level()));
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = HELD_LEVELS.try_with(|levels| levels.borrow_mut().pop());
    }
}

#[cfg(test)]
mod tests {
    use super::{held_level, LockGuard, LockOrder};

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::ThreadRegistry.level(), 1);
        assert_eq!(LockOrder::ThreadLocal.level(), 2);
        assert_eq!(LockOrder::ObjectStore.level(), 3);
        assert_eq!(LockOrder::ExtraObjects.level(), 3);
        assert_eq!(LockOrder::RootRegistry.level(), 3);
    }

    #[test]
    fn test_lock_order_values_are_unique() {
        let values = [
            LockOrder::ThreadRegistry,
            LockOrder::ThreadLocal,
            LockOrder::ObjectStore,
            LockOrder::ExtraObjects,
            LockOrder::RootRegistry,
        ]
        .map(LockOrder::order_value);
        for (i, a) in values.iter().enumerate() {
            for b in &values[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_increasing_order_is_accepted() {
        let _a = LockGuard::new(LockOrder::ThreadRegistry);
        let _b = LockGuard::new(LockOrder::ThreadLocal);
        let _c = LockGuard::new(LockOrder::ObjectStore);
        let _d = LockGuard::new(LockOrder::RootRegistry);
    }

    #[test]
    fn test_guard_release_restores_level() {
        {
            let _a = LockGuard::new(LockOrder::ObjectStore);
            if cfg!(debug_assertions) {
                assert_eq!(held_level(), 3);
            }
        }
        assert_eq!(held_level(), 0);
        let _b = LockGuard::new(LockOrder::ThreadRegistry);
    }

    #[test]
    fn test_downgrade_is_rejected() {
        assert!(!LockOrder::ThreadRegistry.may_follow(LockOrder::ObjectStore.level()));
        assert!(!LockOrder::ThreadLocal.may_follow(LockOrder::RootRegistry.level()));
        assert!(!LockOrder::ThreadRegistry.may_follow(LockOrder::ThreadLocal.level()));
    }

    #[test]
    fn test_same_level_and_upgrade_are_allowed() {
        assert!(LockOrder::ThreadRegistry.may_follow(0));
        assert!(LockOrder::ObjectStore.may_follow(LockOrder::ThreadLocal.level()));
        assert!(LockOrder::ExtraObjects.may_follow(LockOrder::ObjectStore.level()));
        assert!(LockOrder::ObjectStore.may_follow(LockOrder::RootRegistry.level()));
    }
}
