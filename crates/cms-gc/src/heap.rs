//! Heap allocation and the object store.
//!
//! Every heap object is allocated as a [`HeapNode`]: the mark slot, the
//! authoritative allocated size and some flags, followed by the object header
//! and payload. The mark slot doubles as the link field of the intrusive mark
//! and finalizer queues.
//!
//! Freshly allocated objects go into the allocating thread's producer list,
//! not into the [`ObjectStore`]. They become visible to sweep only when the
//! thread is published during root-set collection, so a sweep never sees an
//! object allocated after the root-set snapshot it is working from.

use std::alloc::{self, Layout};
use std::mem::{self, offset_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::AllocError;
use crate::gc::list::{IntrusiveList, Linked};
use crate::gc_assert;
use crate::metrics::MemoryUsage;
use crate::object::{ObjHeader, ObjRef, Residence, TypeInfo};

// ============================================================================
// ObjectData - mark slot and queue link
// ============================================================================

/// Per-object mark slot.
///
/// Null means unmarked, the address of a private static sentinel means
/// marked but not queued, anything else is the next element of the queue the
/// object is linked into (possibly the queue's tail sentinel).
#[derive(Debug)]
pub struct ObjectData {
    next: AtomicPtr<ObjectData>,
}

static QUEUE_TAIL: ObjectData = ObjectData::new();
static MARKED: ObjectData = ObjectData::new();

fn sentinel(data: &'static ObjectData) -> *mut ObjectData {
    ptr::from_ref(data).cast_mut()
}

/// Decoded state of a mark slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkState {
    /// Not marked in the current collection.
    Unmarked,
    /// Marked and already traced (or never queued).
    Marked,
    /// Marked and waiting in a queue.
    Queued {
        /// The object queued after this one; `None` for the last element.
        next: Option<ObjRef>,
    },
}

impl ObjectData {
    const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Decode the slot.
    #[must_use]
    pub fn state(&self) -> MarkState {
        let next = self.next.load(Ordering::Acquire);
        if next.is_null() {
            MarkState::Unmarked
        } else if next == sentinel(&MARKED) {
            MarkState::Marked
        } else if next == sentinel(&QUEUE_TAIL) {
            MarkState::Queued { next: None }
        } else {
            // SAFETY: any other value is the mark slot of a queued heap node.
            let node = NodePtr::from_object_data(unsafe { NonNull::new_unchecked(next) });
            MarkState::Queued {
                next: Some(node.object()),
            }
        }
    }

    /// Whether the slot is marked (queued or not).
    #[must_use]
    pub fn is_marked(&self) -> bool {
        !self.next.load(Ordering::Acquire).is_null()
    }

    /// Mark without queueing.
    pub(crate) fn mark(&self) {
        self.next.store(sentinel(&MARKED), Ordering::Release);
    }

    /// Clear the slot; returns whether it was marked.
    pub(crate) fn try_reset_mark(&self) -> bool {
        !self.next.swap(ptr::null_mut(), Ordering::AcqRel).is_null()
    }
}

// SAFETY: `tail()` is a dedicated static that never backs a heap node, and
// an unlinked slot is null.
unsafe impl Linked for ObjectData {
    fn next(&self) -> *mut Self {
        self.next.load(Ordering::Acquire)
    }

    fn set_next(&self, next: *mut Self) {
        self.next.store(next, Ordering::Release);
    }

    fn try_set_next(&self, next: *mut Self) -> bool {
        self.next
            .compare_exchange(ptr::null_mut(), next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn tail() -> *mut Self {
        sentinel(&QUEUE_TAIL)
    }
}

/// Queue of heap objects linked through their mark slots.
pub type ObjectQueue = IntrusiveList<ObjectData>;

/// Unreachable objects waiting for their finalizers.
pub type FinalizerQueue = ObjectQueue;

// ============================================================================
// HeapNode
// ============================================================================

const PUBLISHED: u8 = 1;

/// Allocation unit of the heap. The object payload follows `header`.
#[repr(C)]
pub(crate) struct HeapNode {
    data: ObjectData,
    size: usize,
    flags: AtomicU8,
    header: ObjHeader,
}

/// Handle to a heap node, convertible to and from [`ObjRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodePtr(NonNull<HeapNode>);

// SAFETY: Nodes are plain heap memory whose shared fields are atomic.
unsafe impl Send for NodePtr {}
// SAFETY: See above.
unsafe impl Sync for NodePtr {}

impl NodePtr {
    pub(crate) fn from_object(object: ObjRef) -> Self {
        gc_assert!(
            object.residence() == Residence::Heap,
            "{object:?} is not a heap object"
        );
        let header = object.as_ptr().cast::<u8>();
        // SAFETY: heap headers are embedded in a HeapNode at this offset.
        let node = unsafe { header.sub(offset_of!(HeapNode, header)) }.cast::<HeapNode>();
        // SAFETY: derived from a non-null header inside a node.
        Self(unsafe { NonNull::new_unchecked(node) })
    }

    pub(crate) const fn from_object_data(data: NonNull<ObjectData>) -> Self {
        // `data` is the first field of the repr(C) node.
        Self(data.cast())
    }

    fn node(&self) -> &HeapNode {
        // SAFETY: NodePtrs only exist for allocated nodes.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn object(self) -> ObjRef {
        ObjRef::from_non_null(NonNull::from(&self.node().header))
    }

    pub(crate) fn object_data(&self) -> &ObjectData {
        &self.node().data
    }

    pub(crate) fn object_data_ptr(self) -> NonNull<ObjectData> {
        self.0.cast()
    }

    pub(crate) fn size(self) -> usize {
        self.node().size
    }

    pub(crate) fn is_published(self) -> bool {
        self.node().flags.load(Ordering::Acquire) & PUBLISHED != 0
    }

    fn publish(self) {
        self.object_data().next.store(ptr::null_mut(), Ordering::Relaxed);
        self.node().flags.fetch_or(PUBLISHED, Ordering::Release);
    }
}

/// Authoritative allocated payload size of a heap object.
#[must_use]
pub fn allocated_size(object: ObjRef) -> usize {
    NodePtr::from_object(object).size()
}

/// Mark state of a heap object.
#[must_use]
pub fn mark_state(object: ObjRef) -> MarkState {
    NodePtr::from_object(object).object_data().state()
}

// ============================================================================
// Allocator
// ============================================================================

/// Heap allocator with byte accounting and an optional limit.
#[derive(Debug)]
pub struct Allocator {
    allocated_bytes: AtomicUsize,
    allocated_objects: AtomicUsize,
    limit: Option<usize>,
}

impl Allocator {
    /// Create an allocator; `limit` caps the total live payload bytes.
    #[must_use]
    pub const fn new(limit: Option<usize>) -> Self {
        Self {
            allocated_bytes: AtomicUsize::new(0),
            allocated_objects: AtomicUsize::new(0),
            limit,
        }
    }

    fn layout(size: usize) -> Result<Layout, AllocError> {
        let total = mem::size_of::<HeapNode>()
            .checked_add(size)
            .ok_or(AllocError::SizeOverflow)?;
        Layout::from_size_align(total, mem::align_of::<HeapNode>())
            .map_err(|_| AllocError::SizeOverflow)
    }

    fn reserve(&self, size: usize) -> Result<(), AllocError> {
        let Some(limit) = self.limit else {
            self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };
        self.allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bytes| {
                bytes.checked_add(size).filter(|&total| total <= limit)
            })
            .map(|_| ())
            .map_err(|_| AllocError::HeapLimitExceeded {
                requested: size,
                limit,
            })
    }

    /// Allocate a zeroed object of `type_info` with `count` array elements.
    pub(crate) fn allocate(
        &self,
        type_info: &'static TypeInfo,
        count: usize,
    ) -> Result<NodePtr, AllocError> {
        let size = type_info
            .payload_size(count)
            .ok_or(AllocError::SizeOverflow)?;
        let layout = Self::layout(size)?;
        self.reserve(size)?;
        // SAFETY: `layout` is non-zero sized.
        let raw = unsafe { alloc::alloc_zeroed(layout) }.cast::<HeapNode>();
        let Some(ptr) = NonNull::new(raw) else {
            self.allocated_bytes.fetch_sub(size, Ordering::Relaxed);
            return Err(AllocError::OutOfMemory { requested: size });
        };
        // SAFETY: fresh, aligned memory large enough for a node.
        unsafe {
            ptr::write(
                ptr.as_ptr(),
                HeapNode {
                    data: ObjectData::new(),
                    size,
                    flags: AtomicU8::new(0),
                    header: ObjHeader::new(type_info, Residence::Heap),
                },
            );
        }
        let node = NodePtr(ptr);
        if type_info.is_array() {
            node.object().init_array_len(count);
        }
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Return a node's memory.
    ///
    /// # Safety
    ///
    /// `node` must come from this allocator, must not be referenced by any
    /// list or store anymore, and its auxiliary record must be uninstalled.
    pub(crate) unsafe fn free(&self, node: NodePtr) {
        let size = node.size();
        gc_assert!(
            node.object().extra_data().is_none(),
            "freeing {:?} with an installed auxiliary record",
            node.object()
        );
        let Ok(layout) = Self::layout(size) else {
            crate::error::fatal(format_args!("corrupt size {size} on freed node"));
        };
        // SAFETY: allocated in `allocate` with the same layout.
        unsafe { alloc::dealloc(node.0.as_ptr().cast(), layout) };
        self.allocated_bytes.fetch_sub(size, Ordering::Relaxed);
        self.allocated_objects.fetch_sub(1, Ordering::Relaxed);
    }

    /// Live payload bytes.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Live object count.
    #[must_use]
    pub fn allocated_objects(&self) -> usize {
        self.allocated_objects.load(Ordering::Relaxed)
    }

    /// The configured heap limit.
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Snapshot of the live heap.
    #[must_use]
    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            objects_count: self.allocated_objects(),
            total_objects_size_bytes: self.allocated_bytes(),
        }
    }
}

// ============================================================================
// ObjectStore
// ============================================================================

/// All published heap objects.
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: Mutex<Vec<NodePtr>>,
    orphans: Mutex<Vec<NodePtr>>,
}

impl ObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `nodes` into the store, clearing their mark slots.
    pub(crate) fn publish(&self, nodes: &mut Vec<NodePtr>) {
        if nodes.is_empty() {
            return;
        }
        for node in nodes.iter() {
            node.publish();
        }
        self.objects.lock().append(nodes);
    }

    /// Park the unpublished objects of a detaching thread.
    pub(crate) fn adopt_orphans(&self, nodes: &mut Vec<NodePtr>) {
        if !nodes.is_empty() {
            self.orphans.lock().append(nodes);
        }
    }

    /// Publish every parked orphan.
    pub(crate) fn publish_orphans(&self) {
        let mut orphans = mem::take(&mut *self.orphans.lock());
        self.publish(&mut orphans);
    }

    /// Number of published objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether no object is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the store for a sweep.
    pub(crate) fn lock_for_iter<'a>(&'a self, allocator: &'a Allocator) -> LockedObjects<'a> {
        LockedObjects {
            objects: self.objects.lock(),
            allocator,
        }
    }

    /// Free every object, published or orphaned. Used on teardown.
    pub(crate) fn release_all(&self, allocator: &Allocator) {
        let mut objects = mem::take(&mut *self.objects.lock());
        objects.append(&mut self.orphans.lock());
        free_all(allocator, objects);
    }
}

/// Free nodes without running finalizers.
pub(crate) fn free_all(allocator: &Allocator, nodes: Vec<NodePtr>) {
    for node in nodes {
        if let Some(extra) = node.object().extra_data() {
            extra.uninstall();
        }
        // SAFETY: the caller hands over exclusive ownership of `nodes`.
        unsafe { allocator.free(node) };
    }
}

/// Exclusive view of the object store supporting in-place removal.
pub struct LockedObjects<'a> {
    objects: MutexGuard<'a, Vec<NodePtr>>,
    allocator: &'a Allocator,
}

impl LockedObjects<'_> {
    /// Number of objects still in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Object at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ObjRef> {
        self.objects.get(index).map(|node| node.object())
    }

    /// Remove the object at `index` and free it. The next object to visit is
    /// now at `index`.
    pub fn erase_and_advance(&mut self, index: usize) {
        let node = self.objects.swap_remove(index);
        if let Some(extra) = node.object().extra_data() {
            extra.uninstall();
        }
        // SAFETY: the node just left the store and is linked nowhere.
        unsafe { self.allocator.free(node) };
    }

    /// Remove the object at `index` and link it into `queue`. The next object
    /// to visit is now at `index`.
    pub fn move_and_advance(&mut self, index: usize, queue: &mut FinalizerQueue) {
        let node = self.objects.swap_remove(index);
        gc_assert!(
            !node.object_data().is_marked(),
            "{:?} moved to the finalizer queue while still marked",
            node.object()
        );
        // SAFETY: the node stays allocated until the finalizer processor frees
        // it, and an unmarked slot is not linked into any list.
        unsafe { queue.push_front(node.object_data_ptr()) };
    }
}
