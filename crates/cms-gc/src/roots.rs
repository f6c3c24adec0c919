//! Root tracking.
//!
//! Roots are the references the collector starts marking from: each
//! mutator's shadow stack and thread-local slots, global slots, and stable
//! references pinned by foreign code.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::object::{load_root, ObjHeader, ObjRef};

// ============================================================================
// ShadowStack - per-thread stack roots
// ============================================================================

/// Explicitly maintained stack of references a mutator holds in locals.
#[derive(Debug, Default)]
pub struct ShadowStack {
    roots: Vec<*mut ObjHeader>,
    frame_markers: Vec<usize>,
}

// SAFETY: The stack only stores addresses; they are read by the collector
// under the owning thread's lock.
unsafe impl Send for ShadowStack {}

impl ShadowStack {
    /// Create an empty shadow stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Push a root. `None` reserves a slot that can be filled later.
    pub fn push(&mut self, root: Option<ObjRef>) -> usize {
        self.roots.push(root.map_or(ptr::null_mut(), ObjRef::as_ptr));
        self.roots.len() - 1
    }

    /// Pop the most recent root.
    pub fn pop(&mut self) -> Option<ObjRef> {
        let top = self.roots.pop()?;
        // SAFETY: only live object headers or null are pushed.
        unsafe { ObjRef::from_raw(top) }
    }

    /// Overwrite the root at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a live slot.
    pub fn set(&mut self, index: usize, root: Option<ObjRef>) {
        self.roots[index] = root.map_or(ptr::null_mut(), ObjRef::as_ptr);
    }

    /// Read the root at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ObjRef> {
        let raw = self.roots.get(index).copied()?;
        // SAFETY: only live object headers or null are stored.
        unsafe { ObjRef::from_raw(raw) }
    }

    /// Number of slots, including empty ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether there are no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Iterate over every slot.
    pub fn iter(&self) -> impl Iterator<Item = Option<ObjRef>> + '_ {
        // SAFETY: only live object headers or null are stored.
        self.roots.iter().map(|&raw| unsafe { ObjRef::from_raw(raw) })
    }

    /// Open a frame; [`pop_frame`](Self::pop_frame) drops everything pushed since.
    pub fn push_frame(&mut self) {
        self.frame_markers.push(self.roots.len());
    }

    /// Close the innermost frame.
    pub fn pop_frame(&mut self) {
        if let Some(marker) = self.frame_markers.pop() {
            self.roots.truncate(marker);
        }
    }

    /// Drop every root and frame.
    pub fn clear(&mut self) {
        self.roots.clear();
        self.frame_markers.clear();
    }
}

// ============================================================================
// RootSlot / GlobalRegistry
// ============================================================================

/// A mutable reference slot treated as a root (global or thread-local).
#[derive(Debug, Default)]
pub struct RootSlot(AtomicPtr<ObjHeader>);

impl RootSlot {
    /// Create a slot holding `value`.
    #[must_use]
    pub fn new(value: Option<ObjRef>) -> Self {
        Self(AtomicPtr::new(value.map_or(ptr::null_mut(), ObjRef::as_ptr)))
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> Option<ObjRef> {
        load_root(&self.0)
    }

    /// Replace the value.
    pub fn set(&self, value: Option<ObjRef>) {
        self.0
            .store(value.map_or(ptr::null_mut(), ObjRef::as_ptr), Ordering::Release);
    }
}

/// Handle to a global root slot.
pub type GlobalRoot = Arc<RootSlot>;

/// Registry of global root slots.
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    globals: Mutex<Vec<GlobalRoot>>,
}

impl GlobalRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new global slot.
    pub fn register(&self, value: Option<ObjRef>) -> GlobalRoot {
        let slot = Arc::new(RootSlot::new(value));
        self.globals.lock().push(Arc::clone(&slot));
        slot
    }

    /// Remove every slot no longer referenced outside the registry.
    pub fn process_deletions(&self) {
        self.globals.lock().retain(|slot| Arc::strong_count(slot) > 1);
    }

    /// Number of registered slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.globals.lock().len()
    }

    /// Whether no slot is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` with every slot value.
    pub fn for_each(&self, mut f: impl FnMut(Option<ObjRef>)) {
        for slot in self.globals.lock().iter() {
            f(slot.get());
        }
    }
}

// ============================================================================
// StableRefRegistry
// ============================================================================

/// A reference pinned by foreign code. Keeps its object alive until disposed.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StableRef {
    id: u64,
    object: ObjRef,
}

impl StableRef {
    /// The pinned object.
    #[must_use]
    pub const fn get(&self) -> ObjRef {
        self.object
    }
}

/// Registry of stable references.
///
/// Disposal is lock-free; disposed references stay roots until the next
/// [`process_deletions`](Self::process_deletions), which every root walk runs first.
#[derive(Debug, Default)]
pub struct StableRefRegistry {
    entries: Mutex<Vec<(u64, ObjRef)>>,
    pending_deletions: SegQueue<u64>,
    next_id: AtomicU64,
}

impl StableRefRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `object`.
    pub fn create(&self, object: ObjRef) -> StableRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, object));
        StableRef { id, object }
    }

    /// Unpin a reference.
    pub fn dispose(&self, stable: StableRef) {
        self.pending_deletions.push(stable.id);
    }

    /// Drop every disposed reference from the registry.
    pub fn process_deletions(&self) {
        if self.pending_deletions.is_empty() {
            return;
        }
        let mut doomed = HashSet::new();
        while let Some(id) = self.pending_deletions.pop() {
            doomed.insert(id);
        }
        self.entries.lock().retain(|(id, _)| !doomed.contains(id));
    }

    /// Number of registered references, including disposed ones not yet compacted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` with every pinned object.
    pub fn for_each(&self, mut f: impl FnMut(ObjRef)) {
        for &(_, object) in self.entries.lock().iter() {
            f(object);
        }
    }
}
