//! Intrusive free lists of bucket items.
//!
//! One list exists per (bucket, generation).  The list type is the
//! allocator's synchronization policy: [`AtomicFreeList`] for instances
//! shared between threads, [`LocalFreeList`] for single-thread instances.

use super::layout::FreeItem;
use crate::sync::atomic::{AtomicU128, Ordering};
use crate::sync::cell::Cell;
use crate::sync::hint;
use std::ptr::NonNull;

/// Operations every free-list policy provides.
pub trait FreeList: Default {
    /// Push a single node.
    ///
    /// # Safety
    /// `item` must be a node written by `FreeItem::write`, exclusively owned
    /// by the caller and not on any list.
    unsafe fn push(&self, item: NonNull<FreeItem>);

    /// Push an already-linked chain `head ..= tail` in one step.
    ///
    /// # Safety
    /// Every node of the chain must satisfy the `push` contract and `tail`
    /// must be reachable from `head`.
    unsafe fn push_chain(&self, head: NonNull<FreeItem>, tail: NonNull<FreeItem>);

    /// Pop the most recently pushed node.
    fn pop(&self) -> Option<NonNull<FreeItem>>;

    /// Detach the whole list and return its head.  The chain is a single
    /// consistent snapshot: no concurrent push or pop is split across it.
    fn take_all(&self) -> Option<NonNull<FreeItem>>;

    /// Relaxed emptiness probe; may be stale under concurrency.
    fn is_empty(&self) -> bool;
}

/// 128-bit tagged head for ABA-safe Treiber-stack operations.
///
/// ```text
///   bits [127:64]  generation counter  (64 bits)
///   bits [63:0]    pointer             (full virtual address)
/// ```
///
/// The generation advances by two on every completed operation.  An odd
/// generation means a pop has pinned the current head to read its link;
/// pushes and other pops wait until it is even again.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: usize, generation: u64) -> Self {
        Self((u128::from(generation) << 64) | ptr as u128)
    }

    #[inline]
    fn ptr(self) -> usize {
        // Truncate to the low word: the full virtual address.
        self.0 as usize
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    fn is_pinned(self) -> bool {
        !self.generation().is_multiple_of(2)
    }
}

impl std::fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:#x}, gen={})", self.ptr(), self.generation())
    }
}

/// Restores a pinned head if a pop unwinds between pin and commit.
struct PopReservation<'a> {
    head: &'a AtomicU128,
    old: TaggedPtr,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // We own the pin (odd generation), so a plain store unlocks it.
            let restored = TaggedPtr::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.head.store(restored.0, Ordering::Release);
        }
    }
}

/// Free list shared between threads.
///
/// A pop pins the head (odd generation) while it reads the node's link, and
/// every other push, pop or `take_all` spins until the pin is released. The
/// list is therefore blocking, not lock-free: a pop that stalls mid-read
/// stalls the list. The pin keeps cleanup from decommitting a node a pop is
/// still reading.
pub struct AtomicFreeList {
    head: AtomicU128,
}

impl Default for AtomicFreeList {
    fn default() -> Self {
        Self {
            head: AtomicU128::new(TaggedPtr::NULL.0),
        }
    }
}

impl AtomicFreeList {
    /// Current head, spinning while a pop has it pinned.
    #[inline]
    fn stable_head(&self) -> TaggedPtr {
        loop {
            let old = TaggedPtr(self.head.load(Ordering::Acquire));
            if !old.is_pinned() {
                return old;
            }
            hint::spin_loop();
        }
    }

    #[inline]
    fn link_onto(&self, head: NonNull<FreeItem>, tail: NonNull<FreeItem>) {
        let new_ptr = head.as_ptr() as usize;
        loop {
            let old = self.stable_head();
            // Safety: tail is owned by the caller until the CAS publishes it.
            unsafe { tail.as_ref() }.set_next(old.ptr());
            let new = TaggedPtr::new(new_ptr, old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl FreeList for AtomicFreeList {
    unsafe fn push(&self, item: NonNull<FreeItem>) {
        self.link_onto(item, item);
    }

    unsafe fn push_chain(&self, head: NonNull<FreeItem>, tail: NonNull<FreeItem>) {
        self.link_onto(head, tail);
    }

    fn pop(&self) -> Option<NonNull<FreeItem>> {
        loop {
            let old = self.stable_head();
            let node = NonNull::new(old.ptr() as *mut FreeItem)?;

            // Pin the head (even -> odd) so no one can pop it while we read
            // its link.
            let pinned = TaggedPtr::new(old.ptr(), old.generation().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.0, pinned.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut guard = PopReservation {
                head: &self.head,
                old,
                committed: false,
            };

            // Safety: the node is pinned; it stays on the list until we
            // commit.
            let next = unsafe { node.as_ref() }.next();

            // Commit (odd -> even).  We hold the pin, so this cannot fail
            // unless the list is corrupt.
            let res = self.head.compare_exchange(
                pinned.0,
                TaggedPtr::new(next, old.generation().wrapping_add(2)).0,
                Ordering::Release,
                Ordering::Relaxed,
            );
            debug_assert!(res.is_ok(), "AtomicFreeList::pop reservation broken!");
            guard.committed = true;
            return Some(node);
        }
    }

    fn take_all(&self) -> Option<NonNull<FreeItem>> {
        loop {
            let old = self.stable_head();
            if old.ptr() == 0 {
                return None;
            }
            let empty = TaggedPtr::new(0, old.generation().wrapping_add(2));
            if self
                .head
                .compare_exchange_weak(old.0, empty.0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return NonNull::new(old.ptr() as *mut FreeItem);
            }
        }
    }

    fn is_empty(&self) -> bool {
        TaggedPtr(self.head.load(Ordering::Relaxed)).ptr() == 0
    }
}

/// Unsynchronized free list for allocators owned by one thread.
pub struct LocalFreeList {
    head: Cell<usize>,
}

impl Default for LocalFreeList {
    fn default() -> Self {
        Self { head: Cell::new(0) }
    }
}

impl FreeList for LocalFreeList {
    unsafe fn push(&self, item: NonNull<FreeItem>) {
        // Safety: upheld by caller.
        unsafe { self.push_chain(item, item) };
    }

    unsafe fn push_chain(&self, head: NonNull<FreeItem>, tail: NonNull<FreeItem>) {
        // Safety: tail is owned by the caller.
        unsafe { tail.as_ref() }.set_next(self.head.get());
        self.head.set(head.as_ptr() as usize);
    }

    fn pop(&self) -> Option<NonNull<FreeItem>> {
        let node = NonNull::new(self.head.get() as *mut FreeItem)?;
        // Safety: nodes on the list are valid until popped.
        self.head.set(unsafe { node.as_ref() }.next());
        Some(node)
    }

    fn take_all(&self) -> Option<NonNull<FreeItem>> {
        NonNull::new(self.head.replace(0) as *mut FreeItem)
    }

    fn is_empty(&self) -> bool {
        self.head.get() == 0
    }
}

/// Walk a detached chain, calling `f` on each node.  The link is read before
/// `f` runs, so `f` may relink the node.
///
/// # Safety
/// The chain must be detached (owned by the caller) and null-terminated.
pub(crate) unsafe fn for_each_node(head: Option<NonNull<FreeItem>>, mut f: impl FnMut(NonNull<FreeItem>)) {
    let mut cursor = head;
    while let Some(node) = cursor {
        // Safety: upheld by caller.
        cursor = NonNull::new(unsafe { node.as_ref() }.next() as *mut FreeItem);
        f(node);
    }
}

/// Sort a detached, null-terminated chain by address.  Returns the new
/// `(head, tail)`.  Bottom-up merge sort: no recursion, no allocation.
///
/// # Safety
/// The chain must be detached (owned by the caller) and null-terminated.
pub(crate) unsafe fn sort_by_address(head: NonNull<FreeItem>) -> (NonNull<FreeItem>, NonNull<FreeItem>) {
    // Safety (whole body): every node is owned by the caller.
    let next_of = |n: usize| unsafe { (*(n as *const FreeItem)).next() };
    let set_next = |n: usize, v: usize| unsafe { (*(n as *const FreeItem)).set_next(v) };

    let mut list = head.as_ptr() as usize;
    let mut run = 1usize;
    loop {
        let mut merges = 0usize;
        let mut out_head = 0usize;
        let mut out_tail = 0usize;
        let mut p = list;
        while p != 0 {
            merges += 1;
            // Split off run `a` of up to `run` nodes, then run `b`.
            let mut q = p;
            let mut a_len = 0;
            while a_len < run && q != 0 {
                q = next_of(q);
                a_len += 1;
            }
            let mut b_len = run;
            while a_len > 0 || (b_len > 0 && q != 0) {
                let take_a = if a_len == 0 {
                    false
                } else if b_len == 0 || q == 0 {
                    true
                } else {
                    p <= q
                };
                let node = if take_a {
                    let n = p;
                    p = next_of(p);
                    a_len -= 1;
                    n
                } else {
                    let n = q;
                    q = next_of(q);
                    b_len -= 1;
                    n
                };
                if out_tail == 0 {
                    out_head = node;
                } else {
                    set_next(out_tail, node);
                }
                out_tail = node;
            }
            p = q;
        }
        set_next(out_tail, 0);
        list = out_head;
        if merges <= 1 {
            // Safety: the chain was non-empty, so both ends are non-null.
            unsafe {
                return (
                    NonNull::new_unchecked(out_head as *mut FreeItem),
                    NonNull::new_unchecked(out_tail as *mut FreeItem),
                );
            }
        }
        run *= 2;
    }
}
