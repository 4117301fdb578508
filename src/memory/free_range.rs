use super::layout::{MIN_RANGE_LEN, PAGE_LEN, RangeNode, page_of};

/// Address-ordered, doubly-linked list of uncarved free byte ranges.
///
/// Nodes live in the first bytes of the ranges they describe.  Ranges never
/// overlap and never cross a page boundary.  Only touched under the heap
/// lock.
#[derive(Default)]
pub(crate) struct FreeRangeList {
    head: usize,
    tail: usize,
    count: usize,
    bytes: usize,
}

impl FreeRangeList {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn total_bytes(&self) -> usize {
        self.bytes
    }

    /// Forget every range.  The bytes themselves are untouched.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Iterate `(start, len)` in address order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == 0 {
                return None;
            }
            // Safety: cursor is a live range node; the lock is held by the
            // owner of `&self`.
            let node = unsafe { RangeNode::at(cursor) };
            let item = (cursor, node.len);
            cursor = node.next;
            Some(item)
        })
    }

    /// Track `[start, start + len)`.  Returns false (and tracks nothing) for
    /// ranges too short to be worth keeping.
    ///
    /// # Safety
    /// The bytes must be committed, free and owned by the heap, and must not
    /// overlap any tracked range.
    pub(crate) unsafe fn insert(&mut self, start: usize, len: usize) -> bool {
        if len < MIN_RANGE_LEN {
            return false;
        }
        debug_assert_eq!(page_of(start), page_of(start + len - 1), "range crosses a page");
        debug_assert!(start + len - page_of(start) <= PAGE_LEN);

        // Walk back from the tail: cleanup rebuilds in address order, so the
        // common case is an append.
        let mut prev = self.tail;
        while prev != 0 && prev > start {
            // Safety: prev is a live node.
            prev = unsafe { RangeNode::at(prev) }.prev;
        }
        let next = if prev == 0 {
            self.head
        } else {
            // Safety: prev is a live node.
            unsafe { RangeNode::at(prev) }.next
        };
        // Safety: upheld by caller.
        unsafe { self.link(start, len, prev, next) };
        true
    }

    /// Replace the range at `start` with up to two remainders, in address
    /// order.  Remainders shorter than the tracking minimum are dropped.
    ///
    /// # Safety
    /// `start` must be a tracked range and every remainder must lie inside
    /// it.
    pub(crate) unsafe fn replace(&mut self, start: usize, remainders: [(usize, usize); 2]) {
        // Safety: upheld by caller.
        let node = unsafe { RangeNode::at(start) };
        let (mut prev, next) = (node.prev, node.next);
        let old_len = node.len;
        self.unlink(prev, next, old_len);
        for (piece, len) in remainders {
            if len >= MIN_RANGE_LEN {
                debug_assert!(piece >= start && piece + len <= start + old_len);
                // Safety: the piece is inside the old range.
                unsafe { self.link(piece, len, prev, next) };
                prev = piece;
            }
        }
    }

    unsafe fn link(&mut self, start: usize, len: usize, prev: usize, next: usize) {
        // Safety: upheld by caller.
        unsafe { RangeNode::write(start, prev, next, len) };
        if prev == 0 {
            self.head = start;
        } else {
            // Safety: prev is a live node.
            unsafe { RangeNode::at(prev) }.next = start;
        }
        if next == 0 {
            self.tail = start;
        } else {
            // Safety: next is a live node.
            unsafe { RangeNode::at(next) }.prev = start;
        }
        self.count += 1;
        self.bytes += len;
    }

    fn unlink(&mut self, prev: usize, next: usize, len: usize) {
        debug_assert!(self.head != 0);
        if prev == 0 {
            self.head = next;
        } else {
            // Safety: prev is a live node.
            unsafe { RangeNode::at(prev) }.next = next;
        }
        if next == 0 {
            self.tail = prev;
        } else {
            // Safety: next is a live node.
            unsafe { RangeNode::at(next) }.prev = prev;
        }
        self.count -= 1;
        self.bytes -= len;
    }
}
