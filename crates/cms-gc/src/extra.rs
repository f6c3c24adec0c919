//! Auxiliary per-object records.
//!
//! Most objects never need more than their header. The few that take part in
//! weak referencing or carry a foreign handle get an [`ExtraObjectData`]
//! record, installed lazily through the header's metadata pointer and owned
//! by the [`ExtraObjectStore`].

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};

use crate::gc_assert;
use crate::object::{load_root, ObjHeader, ObjRef, TypeInfo, WORD};

/// Opaque handle owned by the embedder and released once its object dies.
pub type ForeignHandle = Box<dyn Any + Send>;

/// The object is waiting in a finalizer queue for its handle to be released.
const IN_FINALIZER_QUEUE: u32 = 1;

/// Type of weak-reference counter cells.
///
/// The single slot holds the referent. It is deliberately not listed as a
/// reference field, so the cell does not keep its referent alive.
pub static WEAK_REFERENCE_COUNTER: TypeInfo = TypeInfo::object("WeakReferenceCounter", WORD, &[]);

fn referent_slot(counter: ObjRef) -> &'static AtomicPtr<ObjHeader> {
    gc_assert!(
        ptr::eq(counter.type_info(), &WEAK_REFERENCE_COUNTER),
        "{counter:?} is not a weak reference counter"
    );
    // SAFETY: the counter payload is one word holding the referent.
    unsafe { &*counter.payload().cast::<AtomicPtr<ObjHeader>>() }
}

/// Referent of a weak-reference counter, or `None` once it was collected.
///
/// The result must be rooted before the next safepoint to stay valid.
#[must_use]
pub fn weak_referent(counter: ObjRef) -> Option<ObjRef> {
    load_root(referent_slot(counter))
}

pub(crate) fn init_weak_counter(counter: ObjRef, referent: ObjRef) {
    referent_slot(counter).store(referent.as_ptr(), Ordering::Release);
}

/// Auxiliary record attached to one heap object.
pub struct ExtraObjectData {
    base_object: ObjRef,
    weak_counter: AtomicPtr<ObjHeader>,
    associated: Mutex<Option<ForeignHandle>>,
    flags: AtomicU32,
}

impl ExtraObjectData {
    fn new(base_object: ObjRef) -> Self {
        Self {
            base_object,
            weak_counter: AtomicPtr::new(ptr::null_mut()),
            associated: Mutex::new(None),
            flags: AtomicU32::new(0),
        }
    }

    /// The object this record belongs to.
    #[must_use]
    pub const fn base_object(&self) -> ObjRef {
        self.base_object
    }

    /// The weak-reference counter cell, if one was created.
    #[must_use]
    pub fn weak_counter(&self) -> Option<ObjRef> {
        load_root(&self.weak_counter)
    }

    /// Install `counter` unless another counter got there first; returns the
    /// counter in effect.
    pub(crate) fn install_weak_counter(&self, counter: ObjRef) -> ObjRef {
        match self.weak_counter.compare_exchange(
            ptr::null_mut(),
            counter.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => counter,
            // SAFETY: a non-null slot holds an installed counter.
            Err(existing) => unsafe { ObjRef::from_raw(existing) }.unwrap_or(counter),
        }
    }

    /// Null the counter's referent and forget the counter.
    pub(crate) fn clear_weak_reference_counter(&self) {
        let counter = self.weak_counter.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: a non-null slot holds an installed counter.
        if let Some(counter) = unsafe { ObjRef::from_raw(counter) } {
            referent_slot(counter).store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Whether a foreign handle is attached.
    #[must_use]
    pub fn has_associated_object(&self) -> bool {
        self.associated.lock().is_some()
    }

    pub(crate) fn set_associated_object(&self, handle: ForeignHandle) -> Option<ForeignHandle> {
        self.associated.lock().replace(handle)
    }

    pub(crate) fn take_associated_object(&self) -> Option<ForeignHandle> {
        self.associated.lock().take()
    }

    /// Queue the foreign handle for release on the finalizer thread.
    pub(crate) fn detach_associated_object(&self) {
        self.flags.fetch_or(IN_FINALIZER_QUEUE, Ordering::AcqRel);
    }

    /// Whether the object waits in a finalizer queue for handle release.
    #[must_use]
    pub fn in_finalizer_queue(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_FINALIZER_QUEUE != 0
    }

    /// Disconnect the record from its object's header.
    pub(crate) fn uninstall(&self) {
        let this = ptr::from_ref(self).cast_mut();
        let _ = self.base_object.header().meta().compare_exchange(
            this,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl fmt::Debug for ExtraObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraObjectData")
            .field("base_object", &self.base_object)
            .field("weak_counter", &self.weak_counter())
            .field("in_finalizer_queue", &self.in_finalizer_queue())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExtraPtr(NonNull<ExtraObjectData>);

// SAFETY: The record is shared state with interior synchronization.
unsafe impl Send for ExtraPtr {}
// SAFETY: See above.
unsafe impl Sync for ExtraPtr {}

impl ExtraPtr {
    fn get(&self) -> &ExtraObjectData {
        // SAFETY: records live until the store frees them.
        unsafe { self.0.as_ref() }
    }

    /// Drop the record.
    ///
    /// # Safety
    ///
    /// The record must have been removed from the store and uninstalled.
    unsafe fn free(self) {
        // SAFETY: created by `Box::into_raw` in `install`.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// Owner of every auxiliary record.
#[derive(Debug, Default)]
pub struct ExtraObjectStore {
    records: Mutex<Vec<ExtraPtr>>,
    pending_deletions: SegQueue<ExtraPtr>,
}

impl ExtraObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the record of a heap object.
    pub(crate) fn install(&self, object: ObjRef) -> &'static ExtraObjectData {
        gc_assert!(
            object.is_heap(),
            "auxiliary record requested for non-heap object {object:?}"
        );
        if let Some(existing) = object.extra_data() {
            return existing;
        }
        let fresh = NonNull::from(Box::leak(Box::new(ExtraObjectData::new(object))));
        match object.header().meta().compare_exchange(
            ptr::null_mut(),
            fresh.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.records.lock().push(ExtraPtr(fresh));
                // SAFETY: just installed; freed only by this store.
                unsafe { &*fresh.as_ptr() }
            }
            Err(existing) => {
                // SAFETY: never published.
                unsafe { ExtraPtr(fresh).free() };
                // SAFETY: the header holds a live record.
                unsafe { &*existing }
            }
        }
    }

    /// Ask for a record to be freed at the next [`process_deletions`](Self::process_deletions).
    pub(crate) fn schedule_deletion(&self, record: &ExtraObjectData) {
        record.uninstall();
        self.pending_deletions.push(ExtraPtr(NonNull::from(record)));
    }

    /// Free every record scheduled for deletion.
    pub fn process_deletions(&self) {
        if self.pending_deletions.is_empty() {
            return;
        }
        let mut doomed = HashSet::new();
        while let Some(record) = self.pending_deletions.pop() {
            doomed.insert(record);
        }
        self.records.lock().retain(|record| !doomed.contains(record));
        for record in doomed {
            // SAFETY: removed from the store and uninstalled in `schedule_deletion`.
            unsafe { record.free() };
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the store for a sweep.
    pub fn lock_for_iter(&self) -> LockedExtraObjects<'_> {
        LockedExtraObjects {
            records: self.records.lock(),
        }
    }

    /// Free every record. Used on teardown.
    pub(crate) fn release_all(&self) {
        self.process_deletions();
        for record in mem::take(&mut *self.records.lock()) {
            record.get().uninstall();
            // SAFETY: removed from the store and uninstalled.
            unsafe { record.free() };
        }
    }
}

/// Exclusive view of the auxiliary store supporting in-place removal.
pub struct LockedExtraObjects<'a> {
    records: MutexGuard<'a, Vec<ExtraPtr>>,
}

impl LockedExtraObjects<'_> {
    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ExtraObjectData> {
        self.records.get(index).map(ExtraPtr::get)
    }

    /// Uninstall and free the record at `index`. The next record to visit is
    /// now at `index`.
    pub fn erase_and_advance(&mut self, index: usize) {
        let record = self.records.swap_remove(index);
        record.get().uninstall();
        // SAFETY: removed from the store and uninstalled.
        unsafe { record.free() };
    }
}

#[cfg(test)]
mod tests {
    use super::{weak_referent, ExtraObjectStore, WEAK_REFERENCE_COUNTER};
    use crate::heap::Allocator;
    use crate::object::{TypeInfo, WORD};

    static THING: TypeInfo = TypeInfo::object("Thing", WORD, &[]);

    #[test]
    fn test_install_is_idempotent() {
        let allocator = Allocator::new(None);
        let store = ExtraObjectStore::new();
        let node = allocator.allocate(&THING, 0).unwrap();
        let object = node.object();

        let first = store.install(object);
        let second = store.install(object);
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.base_object(), object);
        assert_eq!(store.len(), 1);
        assert!(object.extra_data().is_some());

        store.release_all();
        assert!(object.extra_data().is_none());
        unsafe { allocator.free(node) };
    }

    #[test]
    fn test_weak_counter_clear() {
        let allocator = Allocator::new(None);
        let store = ExtraObjectStore::new();
        let referent = allocator.allocate(&THING, 0).unwrap();
        let counter = allocator.allocate(&WEAK_REFERENCE_COUNTER, 0).unwrap();
        super::init_weak_counter(counter.object(), referent.object());

        let extra = store.install(referent.object());
        assert_eq!(extra.install_weak_counter(counter.object()), counter.object());
        assert_eq!(weak_referent(counter.object()), Some(referent.object()));

        extra.clear_weak_reference_counter();
        assert!(extra.weak_counter().is_none());
        assert_eq!(weak_referent(counter.object()), None);

        store.release_all();
        unsafe {
            allocator.free(referent);
            allocator.free(counter);
        }
    }

    #[test]
    fn test_associated_object_lifecycle() {
        let allocator = Allocator::new(None);
        let store = ExtraObjectStore::new();
        let node = allocator.allocate(&THING, 0).unwrap();
        let extra = store.install(node.object());

        assert!(!extra.has_associated_object());
        assert!(extra.set_associated_object(Box::new(7_u32)).is_none());
        assert!(extra.has_associated_object());
        assert!(!extra.in_finalizer_queue());
        extra.detach_associated_object();
        assert!(extra.in_finalizer_queue());
        let handle = extra.take_associated_object().unwrap();
        assert_eq!(handle.downcast_ref::<u32>(), Some(&7));

        store.release_all();
        unsafe { allocator.free(node) };
    }

    #[test]
    fn test_process_deletions() {
        let allocator = Allocator::new(None);
        let store = ExtraObjectStore::new();
        let a = allocator.allocate(&THING, 0).unwrap();
        let b = allocator.allocate(&THING, 0).unwrap();
        let extra_a = store.install(a.object());
        store.install(b.object());

        store.schedule_deletion(extra_a);
        assert!(a.object().extra_data().is_none());
        assert_eq!(store.len(), 2);
        store.process_deletions();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.lock_for_iter().get(0).map(super::ExtraObjectData::base_object),
            Some(b.object())
        );

        store.release_all();
        unsafe {
            allocator.free(a);
            allocator.free(b);
        }
    }
}
