//! The memory context shared by the collector and every mutator.

use crate::extra::ExtraObjectStore;
use crate::heap::{free_all, Allocator, ObjectStore};
use crate::roots::{GlobalRegistry, StableRefRegistry};
use crate::thread::ThreadRegistry;

/// Heap, object store and every root registry of one runtime.
///
/// Owned by the [`Runtime`](crate::Runtime) through an `Arc` and handed to
/// the collector at construction; nothing in the crate reaches a process-wide
/// singleton.
#[derive(Debug)]
pub struct MemoryContext {
    allocator: Allocator,
    objects: ObjectStore,
    extra_objects: ExtraObjectStore,
    threads: ThreadRegistry,
    globals: GlobalRegistry,
    stable_refs: StableRefRegistry,
}

impl MemoryContext {
    /// Create a context; `max_heap_bytes` caps live payload bytes.
    #[must_use]
    pub fn new(max_heap_bytes: Option<usize>) -> Self {
        Self {
            allocator: Allocator::new(max_heap_bytes),
            objects: ObjectStore::new(),
            extra_objects: ExtraObjectStore::new(),
            threads: ThreadRegistry::new(),
            globals: GlobalRegistry::new(),
            stable_refs: StableRefRegistry::new(),
        }
    }

    /// The heap allocator.
    #[must_use]
    pub const fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Published heap objects.
    #[must_use]
    pub const fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Auxiliary records.
    #[must_use]
    pub const fn extra_objects(&self) -> &ExtraObjectStore {
        &self.extra_objects
    }

    /// Registered mutators.
    #[must_use]
    pub const fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Global roots.
    #[must_use]
    pub const fn globals(&self) -> &GlobalRegistry {
        &self.globals
    }

    /// Stable references.
    #[must_use]
    pub const fn stable_refs(&self) -> &StableRefRegistry {
        &self.stable_refs
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        // Records point at their objects, so they go first.
        self.extra_objects.release_all();
        for thread in self.threads.lock_for_iter().iter() {
            free_all(&self.allocator, thread.take_unpublished());
        }
        self.objects.release_all(&self.allocator);
    }
}

#[cfg(test)]
impl MemoryContext {
    /// Allocate an object straight into the store, bypassing any mutator.
    pub(crate) fn allocate_published(
        &self,
        type_info: &'static crate::object::TypeInfo,
        count: usize,
    ) -> crate::object::ObjRef {
        let node = self
            .allocator
            .allocate(type_info, count)
            .expect("test allocation failed");
        self.objects.publish(&mut vec![node]);
        node.object()
    }
}
