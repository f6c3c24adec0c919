//! Object headers, references and type descriptors.
//!
//! Every managed object starts with an [`ObjHeader`] followed by its payload.
//! Pointer-valued fields live in the payload at word-aligned offsets listed by
//! the object's [`TypeInfo`], and are read and written atomically so the
//! collector can trace them while mutators keep running.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::extra::ExtraObjectData;
use crate::gc_assert;

/// Size of a pointer-valued field.
pub const WORD: usize = mem::size_of::<usize>();

/// Finalizer hook run on the finalizer thread before an object is freed.
pub type Finalizer = fn(ObjRef);

// ============================================================================
// TypeInfo - per-type descriptor
// ============================================================================

/// Shape of the objects described by a [`TypeInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Fixed-size object with pointer fields at known offsets.
    Object,
    /// Array whose elements are all references.
    ObjectArray,
    /// Array of plain data; never traced.
    PrimitiveArray {
        /// Size of a single element in bytes.
        element_size: usize,
    },
}

/// Type descriptor consumed by the collector.
#[derive(Debug)]
pub struct TypeInfo {
    name: &'static str,
    kind: TypeKind,
    instance_size: usize,
    object_offsets: &'static [usize],
    finalizer: Option<Finalizer>,
}

impl TypeInfo {
    /// Describe a fixed-size object type.
    ///
    /// # Panics
    ///
    /// Panics (at compile time when used in a `const`) if an offset is not
    /// word aligned or the field does not fit in `instance_size`.
    #[must_use]
    pub const fn object(
        name: &'static str,
        instance_size: usize,
        object_offsets: &'static [usize],
    ) -> Self {
        let mut i = 0;
        while i < object_offsets.len() {
            let offset = object_offsets[i];
            assert!(offset % WORD == 0, "reference field offset must be word aligned");
            assert!(
                offset + WORD <= instance_size,
                "reference field must fit inside the instance"
            );
            i += 1;
        }
        Self {
            name,
            kind: TypeKind::Object,
            instance_size,
            object_offsets,
            finalizer: None,
        }
    }

    /// Describe an array of references.
    #[must_use]
    pub const fn object_array(name: &'static str) -> Self {
        Self {
            name,
            kind: TypeKind::ObjectArray,
            instance_size: 0,
            object_offsets: &[],
            finalizer: None,
        }
    }

    /// Describe an array of `element_size`-byte plain values.
    #[must_use]
    pub const fn primitive_array(name: &'static str, element_size: usize) -> Self {
        Self {
            name,
            kind: TypeKind::PrimitiveArray { element_size },
            instance_size: 0,
            object_offsets: &[],
            finalizer: None,
        }
    }

    /// Attach a finalizer to this type.
    #[must_use]
    pub const fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Type name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Object shape.
    #[must_use]
    pub const fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Payload size of a non-array instance.
    #[must_use]
    pub const fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Payload offsets of the reference fields.
    #[must_use]
    pub const fn object_offsets(&self) -> &'static [usize] {
        self.object_offsets
    }

    /// The finalizer, if the type declares one.
    #[must_use]
    pub const fn finalizer(&self) -> Option<Finalizer> {
        self.finalizer
    }

    /// Whether the type declares finalizer behavior.
    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Whether instances are arrays.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        !matches!(self.kind, TypeKind::Object)
    }

    /// Payload size for an instance with `count` elements.
    ///
    /// Arrays store their length in the first payload word.
    pub(crate) const fn payload_size(&self, count: usize) -> Option<usize> {
        let element_size = match self.kind {
            TypeKind::Object => return Some(self.instance_size),
            TypeKind::ObjectArray => WORD,
            TypeKind::PrimitiveArray { element_size } => element_size,
        };
        match count.checked_mul(element_size) {
            Some(bytes) => bytes.checked_add(WORD),
            None => None,
        }
    }

    /// Call `f` for every non-null reference held by `object`.
    pub fn for_each_reference<F>(&self, object: ObjRef, mut f: F)
    where
        F: FnMut(ObjRef),
    {
        match self.kind {
            TypeKind::Object => {
                for &offset in self.object_offsets {
                    if let Some(field) = object.load_at(offset) {
                        f(field);
                    }
                }
            }
            TypeKind::ObjectArray => {
                for index in 0..object.array_len() {
                    if let Some(element) = object.load_element(index) {
                        f(element);
                    }
                }
            }
            TypeKind::PrimitiveArray { .. } => {}
        }
    }
}

// ============================================================================
// ObjHeader / ObjRef
// ============================================================================

/// Where an object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Residence {
    /// Allocated through the collector's allocator; has a mark slot.
    Heap = 0,
    /// Immortal object outside the heap.
    Permanent = 1,
    /// Object whose lifetime is bound to a stack frame.
    Stack = 2,
}

/// Header shared by every managed object.
#[repr(C)]
pub struct ObjHeader {
    type_info: &'static TypeInfo,
    meta: AtomicPtr<ExtraObjectData>,
    residence: Residence,
}

/// Bytes between the start of a header and its payload.
pub(crate) const PAYLOAD_OFFSET: usize = mem::size_of::<ObjHeader>();

impl ObjHeader {
    pub(crate) const fn new(type_info: &'static TypeInfo, residence: Residence) -> Self {
        Self {
            type_info,
            meta: AtomicPtr::new(ptr::null_mut()),
            residence,
        }
    }

    pub(crate) fn meta(&self) -> &AtomicPtr<ExtraObjectData> {
        &self.meta
    }
}

/// A reference to a managed object.
///
/// `ObjRef` is a plain address; holding one does not keep the object alive.
/// Mutators keep objects alive through roots (shadow stack, thread locals,
/// globals, stable references) or through fields of other live objects.
///
/// # Validity
///
/// The accessors dereference the address without checking it. A reference
/// is valid while its object is rooted or reachable from a root. A freshly
/// allocated, unrooted object is valid only until the next safepoint of the
/// mutator that allocated it. After that the sweep may free it, and calling
/// any accessor on the stale reference is undefined behavior.
///
/// ```
/// use cms_gc::{GcConfig, MarkingBehavior, Runtime, TypeInfo, WORD};
///
/// static PAIR: TypeInfo = TypeInfo::object("Pair", 2 * WORD, &[0, WORD]);
///
/// let runtime = Runtime::new(GcConfig::default().with_marking_behavior(MarkingBehavior::Inline));
/// let mutator = runtime.attach_thread();
/// let pair = mutator.allocate(&PAIR).unwrap();
/// // Rooted before the next safepoint, so `pair` stays valid across collections.
/// mutator.push_root(Some(pair));
/// let child = mutator.allocate(&PAIR).unwrap();
/// pair.store_field(0, Some(child));
/// mutator.collect();
/// assert_eq!(pair.load_field(0), Some(child));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonNull<ObjHeader>);

// SAFETY: An ObjRef is an address; all shared state behind it (fields, mark
// slot, metadata pointer) is accessed atomically.
unsafe impl Send for ObjRef {}
// SAFETY: See above.
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// Wrap a raw header pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live, initialized object header.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut ObjHeader) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub(crate) const fn from_non_null(ptr: NonNull<ObjHeader>) -> Self {
        Self(ptr)
    }

    /// Raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut ObjHeader {
        self.0.as_ptr()
    }

    pub(crate) fn header(&self) -> &ObjHeader {
        // SAFETY: ObjRefs are only handed out for live objects.
        unsafe { self.0.as_ref() }
    }

    /// The object's type descriptor.
    #[must_use]
    pub fn type_info(self) -> &'static TypeInfo {
        self.header().type_info
    }

    /// Where the object lives.
    #[must_use]
    pub fn residence(self) -> Residence {
        self.header().residence
    }

    /// Whether the object was allocated on the collected heap.
    #[must_use]
    pub fn is_heap(self) -> bool {
        self.residence() == Residence::Heap
    }

    /// Start of the payload.
    #[must_use]
    pub fn payload(self) -> *mut u8 {
        // SAFETY: every object has a payload directly after its header.
        unsafe { self.as_ptr().cast::<u8>().add(PAYLOAD_OFFSET) }
    }

    fn slot_at(self, offset: usize) -> &'static AtomicPtr<ObjHeader> {
        // SAFETY: callers only pass offsets of reference slots inside the
        // payload, which are word aligned and initialized (zeroed or stored).
        unsafe { &*self.payload().add(offset).cast::<AtomicPtr<ObjHeader>>() }
    }

    fn load_at(self, offset: usize) -> Option<Self> {
        NonNull::new(self.slot_at(offset).load(Ordering::Acquire)).map(Self)
    }

    fn store_at(self, offset: usize, value: Option<Self>) {
        self.slot_at(offset)
            .store(value.map_or(ptr::null_mut(), Self::as_ptr), Ordering::Release);
    }

    fn field_offset(self, index: usize) -> usize {
        let type_info = self.type_info();
        assert!(
            type_info.kind == TypeKind::Object,
            "{} is not a plain object",
            type_info.name
        );
        let offsets = type_info.object_offsets;
        assert!(
            index < offsets.len(),
            "field {index} out of range for {}",
            type_info.name
        );
        offsets[index]
    }

    /// Load the `index`-th reference field.
    ///
    /// `self` must be valid; see [validity](ObjRef#validity).
    ///
    /// # Panics
    ///
    /// Panics if the object is an array or has no such field.
    #[must_use]
    pub fn load_field(self, index: usize) -> Option<Self> {
        self.load_at(self.field_offset(index))
    }

    /// Store into the `index`-th reference field.
    ///
    /// `self` must be valid; see [validity](ObjRef#validity).
    ///
    /// # Panics
    ///
    /// Panics if the object is an array or has no such field.
    pub fn store_field(self, index: usize, value: Option<Self>) {
        self.store_at(self.field_offset(index), value);
    }

    fn len_slot(self) -> &'static AtomicUsize {
        // SAFETY: arrays keep their length in the first payload word.
        unsafe { &*self.payload().cast::<AtomicUsize>() }
    }

    /// Number of elements of an array; zero for plain objects.
    #[must_use]
    pub fn array_len(self) -> usize {
        if self.type_info().is_array() {
            self.len_slot().load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub(crate) fn init_array_len(self, len: usize) {
        self.len_slot().store(len, Ordering::Relaxed);
    }

    fn element_offset(self, index: usize) -> usize {
        let type_info = self.type_info();
        assert!(
            type_info.kind == TypeKind::ObjectArray,
            "{} is not a reference array",
            type_info.name
        );
        let len = self.array_len();
        assert!(index < len, "index {index} out of bounds for array of {len}");
        WORD + index * WORD
    }

    /// Load an element of a reference array.
    ///
    /// `self` must be valid; see [validity](ObjRef#validity).
    ///
    /// # Panics
    ///
    /// Panics if the object is not a reference array or `index` is out of bounds.
    #[must_use]
    pub fn load_element(self, index: usize) -> Option<Self> {
        self.load_at(self.element_offset(index))
    }

    /// Store an element of a reference array.
    ///
    /// `self` must be valid; see [validity](ObjRef#validity).
    ///
    /// # Panics
    ///
    /// Panics if the object is not a reference array or `index` is out of bounds.
    pub fn store_element(self, index: usize, value: Option<Self>) {
        self.store_at(self.element_offset(index), value);
    }

    /// Auxiliary record attached to the object, if any.
    #[must_use]
    pub fn extra_data(self) -> Option<&'static ExtraObjectData> {
        let meta = self.header().meta.load(Ordering::Acquire);
        // SAFETY: installed records stay allocated until the record store
        // frees them, which happens only after they were uninstalled.
        unsafe { meta.as_ref() }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({}@{:p})", self.type_info().name, self.0)
    }
}

/// Load a raw root slot as an optional reference.
pub(crate) fn load_root(slot: &AtomicPtr<ObjHeader>) -> Option<ObjRef> {
    NonNull::new(slot.load(Ordering::Acquire)).map(ObjRef)
}

// ============================================================================
// NonHeapObject - permanent and stack objects
// ============================================================================

/// An object living outside the collected heap.
///
/// Non-heap objects have no mark slot. When they appear in the root set the
/// collector traces their fields directly; references to them from heap
/// objects are never followed.
pub struct NonHeapObject {
    object: ObjRef,
    layout: Layout,
}

// SAFETY: The object memory is owned by this value and only accessed
// through atomics.
unsafe impl Send for NonHeapObject {}
// SAFETY: See above.
unsafe impl Sync for NonHeapObject {}

impl NonHeapObject {
    fn new(type_info: &'static TypeInfo, residence: Residence, count: usize) -> Self {
        let payload = type_info.payload_size(count).unwrap_or(usize::MAX);
        let size = PAYLOAD_OFFSET
            .checked_add(payload)
            .unwrap_or_else(|| panic!("non-heap object of {} is too large", type_info.name));
        let layout = Layout::from_size_align(size, mem::align_of::<ObjHeader>())
            .unwrap_or_else(|_| panic!("invalid layout for {}", type_info.name));
        // SAFETY: `layout` has non-zero size (it includes the header).
        let raw = unsafe { alloc::alloc_zeroed(layout) }.cast::<ObjHeader>();
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        // SAFETY: freshly allocated, properly aligned memory.
        unsafe { ptr::write(ptr.as_ptr(), ObjHeader::new(type_info, residence)) };
        let object = ObjRef(ptr);
        if type_info.is_array() {
            object.init_array_len(count);
        }
        Self { object, layout }
    }

    /// Create an immortal object.
    #[must_use]
    pub fn permanent(type_info: &'static TypeInfo) -> Self {
        Self::new(type_info, Residence::Permanent, 0)
    }

    /// Create an immortal reference array.
    #[must_use]
    pub fn permanent_array(type_info: &'static TypeInfo, len: usize) -> Self {
        Self::new(type_info, Residence::Permanent, len)
    }

    /// Create an object with stack residence. The caller roots it on a
    /// shadow stack for as long as its frame is live.
    #[must_use]
    pub fn stack(type_info: &'static TypeInfo) -> Self {
        Self::new(type_info, Residence::Stack, 0)
    }

    /// Reference to the object.
    #[must_use]
    pub const fn as_ref(&self) -> ObjRef {
        self.object
    }

    /// Leak the object, making it live for the rest of the process.
    #[must_use]
    pub fn leak(self) -> ObjRef {
        let object = self.object;
        mem::forget(self);
        object
    }
}

impl Drop for NonHeapObject {
    fn drop(&mut self) {
        gc_assert!(
            self.object.extra_data().is_none(),
            "non-heap object {:?} carries an auxiliary record",
            self.object
        );
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.object.as_ptr().cast(), self.layout) };
    }
}
