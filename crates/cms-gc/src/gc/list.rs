//! Intrusive singly linked list.
//!
//! The link storage lives inside each element, so the list owns nothing but
//! its head pointer. A list is terminated by a per-type static tail sentinel
//! rather than by null: a null link means "not in any list", which is what
//! lets [`IntrusiveList::try_push_front`] double as a CAS-guarded "enqueue at
//! most once" primitive.
//!
//! The same container backs the mark queue and the finalizer queue.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// An element that carries its own list link.
///
/// # Safety
///
/// `tail()` must return the same non-null address on every call, and that
/// address must never be the address of a real element. `next` must return
/// null for an element that is not linked into any list.
pub unsafe trait Linked {
    /// Load the link field.
    fn next(&self) -> *mut Self;

    /// Store the link field unconditionally.
    fn set_next(&self, next: *mut Self);

    /// Store the link field only if it is currently null.
    ///
    /// Returns `false` without touching the field if it was already set.
    fn try_set_next(&self, next: *mut Self) -> bool;

    /// The list terminator shared by every list of this element type.
    fn tail() -> *mut Self;
}

/// A position inside a list, used by the splice operations.
pub enum Position<T> {
    /// The position before the first element.
    BeforeBegin,
    /// The position of a linked element.
    At(NonNull<T>),
}

impl<T> Clone for Position<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Position<T> {}

impl<T> PartialEq for Position<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::BeforeBegin, Self::BeforeBegin) => true,
            (Self::At(a), Self::At(b)) => a == b,
            _ => false,
        }
    }
}

impl<T> Eq for Position<T> {}

impl<T> fmt::Debug for Position<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeBegin => f.write_str("BeforeBegin"),
            Self::At(ptr) => f.debug_tuple("At").field(ptr).finish(),
        }
    }
}

/// A non-owning singly linked list over [`Linked`] elements.
pub struct IntrusiveList<T: Linked> {
    head: *mut T,
    _marker: PhantomData<NonNull<T>>,
}

// SAFETY: The list holds raw element addresses only. Moving the list to
// another thread moves the right to relink those elements; every element
// type used with it keeps its link in an atomic field.
unsafe impl<T: Linked + Sync> Send for IntrusiveList<T> {}

impl<T: Linked> IntrusiveList<T> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: T::tail(),
            _marker: PhantomData,
        }
    }

    /// Whether the list has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head == T::tail()
    }

    /// Number of elements. Walks the whole list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// The first element, if any.
    #[must_use]
    pub fn front(&self) -> Option<NonNull<T>> {
        if self.is_empty() {
            None
        } else {
            NonNull::new(self.head)
        }
    }

    /// Forget every element without touching their links.
    ///
    /// Elements keep whatever link they had; callers that reuse them must
    /// reset the links themselves.
    pub fn clear(&mut self) {
        self.head = T::tail();
    }

    /// Link `value` at the front unconditionally.
    ///
    /// # Safety
    ///
    /// `value` must be valid for as long as it stays in the list and must not
    /// currently be linked into any list.
    pub unsafe fn push_front(&mut self, value: NonNull<T>) {
        // SAFETY: caller guarantees `value` is valid.
        unsafe { value.as_ref() }.set_next(self.head);
        self.head = value.as_ptr();
    }

    /// Link `value` at the front only if its link field is null.
    ///
    /// Concurrent attempts on the same element from different lists succeed
    /// for at most one caller.
    ///
    /// # Safety
    ///
    /// `value` must be valid for as long as it stays in the list.
    pub unsafe fn try_push_front(&mut self, value: NonNull<T>) -> bool {
        // SAFETY: caller guarantees `value` is valid.
        if !unsafe { value.as_ref() }.try_set_next(self.head) {
            return false;
        }
        self.head = value.as_ptr();
        true
    }

    /// Unlink and return the first element.
    ///
    /// The popped element keeps its (now stale) link; the caller decides what
    /// state the element is left in.
    pub fn try_pop_front(&mut self) -> Option<NonNull<T>> {
        let top = self.front()?;
        // SAFETY: linked elements are valid while in the list.
        self.head = unsafe { top.as_ref() }.next();
        Some(top)
    }

    /// Unlink every element matching `predicate`, keeping the relative order
    /// of the rest. Removed elements get a null link.
    pub fn remove_if<F>(&mut self, mut predicate: F)
    where
        F: FnMut(NonNull<T>) -> bool,
    {
        let tail = T::tail();
        let mut prev: Option<NonNull<T>> = None;
        let mut cur = self.head;
        while cur != tail {
            // SAFETY: `cur` is a linked element, so non-null and valid.
            let node = unsafe { NonNull::new_unchecked(cur) };
            // SAFETY: as above.
            let next = unsafe { node.as_ref() }.next();
            if predicate(node) {
                match prev {
                    // SAFETY: `p` is a linked element.
                    Some(p) => unsafe { p.as_ref() }.set_next(next),
                    None => self.head = next,
                }
                // SAFETY: `node` is valid; it is no longer reachable from the list.
                unsafe { node.as_ref() }.set_next(ptr::null_mut());
            } else {
                prev = Some(node);
            }
            cur = next;
        }
    }

    /// Link `value` right after `pos` and return the position of `value`.
    ///
    /// # Safety
    ///
    /// Same contract as [`push_front`](Self::push_front); `pos` must belong
    /// to this list.
    pub unsafe fn insert_after(&mut self, pos: Position<T>, value: NonNull<T>) -> Position<T> {
        match pos {
            // SAFETY: forwarded caller contract.
            Position::BeforeBegin => unsafe { self.push_front(value) },
            Position::At(at) => {
                // SAFETY: `at` is linked in this list; `value` is valid.
                let (at, v) = unsafe { (at.as_ref(), value.as_ref()) };
                v.set_next(at.next());
                at.set_next(value.as_ptr());
            }
        }
        Position::At(value)
    }

    /// Link every element of `values`, in order, after `pos`. Returns the
    /// position of the last inserted element (or `pos` if `values` is empty).
    ///
    /// # Safety
    ///
    /// Same contract as [`insert_after`](Self::insert_after) for every element.
    pub unsafe fn insert_range_after<I>(&mut self, mut pos: Position<T>, values: I) -> Position<T>
    where
        I: IntoIterator<Item = NonNull<T>>,
    {
        for value in values {
            // SAFETY: forwarded caller contract.
            pos = unsafe { self.insert_after(pos, value) };
        }
        pos
    }

    /// Unlink the element after `pos` and return it. The removed element gets
    /// a null link.
    pub fn erase_after(&mut self, pos: Position<T>) -> Option<NonNull<T>> {
        let tail = T::tail();
        let victim = match pos {
            Position::BeforeBegin => self.head,
            // SAFETY: `at` is linked in this list.
            Position::At(at) => unsafe { at.as_ref() }.next(),
        };
        if victim == tail {
            return None;
        }
        // SAFETY: `victim` is a linked element.
        let victim = unsafe { NonNull::new_unchecked(victim) };
        // SAFETY: as above.
        let next = unsafe { victim.as_ref() }.next();
        match pos {
            Position::BeforeBegin => self.head = next,
            // SAFETY: `at` is linked in this list.
            Position::At(at) => unsafe { at.as_ref() }.set_next(next),
        }
        // SAFETY: `victim` is valid and now unlinked.
        unsafe { victim.as_ref() }.set_next(ptr::null_mut());
        Some(victim)
    }

    /// Unlink the elements strictly between `first` and `last`.
    ///
    /// `last` of `None` means the end of the list. Returns how many elements
    /// were unlinked.
    pub fn erase_range_after(&mut self, first: Position<T>, last: Option<NonNull<T>>) -> usize {
        let stop = last.map_or_else(T::tail, NonNull::as_ptr);
        let mut erased = 0;
        loop {
            let next = match first {
                Position::BeforeBegin => self.head,
                // SAFETY: `at` is linked in this list.
                Position::At(at) => unsafe { at.as_ref() }.next(),
            };
            if next == stop || next == T::tail() {
                return erased;
            }
            self.erase_after(first);
            erased += 1;
        }
    }

    /// Move the whole chain out of `self` in O(1), leaving `self` empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Move every element of `other` to the front of `self`.
    ///
    /// Walks `other` once to find its last element.
    pub fn splice_front(&mut self, other: &mut Self) {
        let mut last = None;
        for node in other.iter() {
            last = Some(node);
        }
        if let Some(last) = last {
            // SAFETY: `last` is linked in `other`, which we own exclusively.
            unsafe { last.as_ref() }.set_next(self.head);
            self.head = other.head;
            other.clear();
        }
    }

    /// Iterate over the elements front to back.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head,
            _list: PhantomData,
        }
    }
}

impl<T: Linked> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> fmt::Debug for IntrusiveList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over the elements of an [`IntrusiveList`].
pub struct Iter<'a, T: Linked> {
    cur: *mut T,
    _list: PhantomData<&'a IntrusiveList<T>>,
}

impl<T: Linked> Iterator for Iter<'_, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == T::tail() {
            return None;
        }
        let node = NonNull::new(self.cur)?;
        // SAFETY: linked elements are valid while the list is borrowed.
        self.cur = unsafe { node.as_ref() }.next();
        Some(node)
    }
}
