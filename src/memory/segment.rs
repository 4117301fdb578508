use super::layout::PAGE_LEN;
use super::stats;
use super::vm::VmOps;
use crate::sync::atomic::{AtomicUsize, Ordering};
use fixedbitset::FixedBitSet;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Committed-page bitmap of one segment.
pub(crate) struct PageBitmap(FixedBitSet);

impl PageBitmap {
    pub(crate) fn new(pages: usize) -> Self {
        Self(FixedBitSet::with_capacity(pages))
    }

    #[inline]
    pub(crate) fn is_set(&self, page: usize) -> bool {
        self.0.contains(page)
    }

    #[inline]
    pub(crate) fn set(&mut self, page: usize, mapped: bool) {
        self.0.set(page, mapped);
    }

    /// First clear bit at or after `cursor`, wrapping to the start.
    pub(crate) fn find_next_unset_from(&self, cursor: usize) -> Option<usize> {
        self.0
            .zeroes()
            .find(|&page| page >= cursor)
            .or_else(|| self.0.zeroes().next())
    }

    #[allow(dead_code)]
    pub(crate) fn count_set(&self) -> usize {
        self.0.count_ones(..)
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

/// Hot segment state: base addresses, read lock-free on every deallocate.
///
/// Slots are published once (base first, then `len` with Release) and never
/// change until the allocator is dropped.
pub(crate) struct SegmentMap {
    bases: Box<[AtomicUsize]>,
    len: AtomicUsize,
    span: usize,
}

impl SegmentMap {
    pub(crate) fn new(max_segments: usize, span: usize) -> Self {
        Self {
            bases: (0..max_segments).map(|_| AtomicUsize::new(0)).collect(),
            len: AtomicUsize::new(0),
            span,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn base(&self, segment: usize) -> usize {
        self.bases[segment].load(Ordering::Relaxed)
    }

    /// Segment index and page index of `addr`.
    #[inline]
    pub(crate) fn locate(&self, addr: usize) -> Option<(usize, usize)> {
        (0..self.len()).find_map(|segment| {
            let offset = addr.wrapping_sub(self.base(segment));
            (offset < self.span).then_some((segment, offset / PAGE_LEN))
        })
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.locate(addr).is_some()
    }

    fn publish(&self, base: usize) -> usize {
        let segment = self.len.load(Ordering::Relaxed);
        self.bases[segment].store(base, Ordering::Relaxed);
        self.len.store(segment + 1, Ordering::Release);
        segment
    }
}

/// Cold segment state, owned by the heap lock.
struct SegmentSlot {
    reservation: Option<(NonNull<u8>, usize)>,
    base: usize,
    pages: PageBitmap,
    last_mapped: usize,
    committed: usize,
}

/// Reserves segments and commits/decommits their pages.
///
/// Every slot (including its bitmap) is allocated up front, so nothing here
/// touches the global allocator after construction.
pub(crate) struct SegmentSet<V: VmOps> {
    slots: Vec<SegmentSlot>,
    reserved: usize,
    span: usize,
    _vm: PhantomData<fn() -> V>,
}

// Safety: the raw reservation pointers are only dereferenced through VmOps
// while the owner holds the heap lock.
unsafe impl<V: VmOps> Send for SegmentSet<V> {}

impl<V: VmOps> SegmentSet<V> {
    pub(crate) fn new(max_segments: usize, span: usize) -> Self {
        let pages = span / PAGE_LEN;
        Self {
            slots: (0..max_segments)
                .map(|_| SegmentSlot {
                    reservation: None,
                    base: 0,
                    pages: PageBitmap::new(pages),
                    last_mapped: pages - 1,
                    committed: 0,
                })
                .collect(),
            reserved: 0,
            span,
            _vm: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub(crate) fn pages_per_segment(&self) -> usize {
        self.span / PAGE_LEN
    }

    #[inline]
    pub(crate) fn base(&self, segment: usize) -> usize {
        self.slots[segment].base
    }

    #[inline]
    pub(crate) fn is_page_mapped(&self, segment: usize, page: usize) -> bool {
        self.slots[segment].pages.is_set(page)
    }

    #[allow(dead_code)]
    pub(crate) fn mapped_pages(&self) -> usize {
        self.slots[..self.reserved].iter().map(|s| s.pages.count_set()).sum()
    }

    /// Reserve the next segment, page-aligned.  `None` once the limit is
    /// reached or the OS refuses the reservation.
    pub(crate) fn reserve_segment(&mut self, map: &SegmentMap) -> Option<usize> {
        if self.reserved == self.slots.len() {
            log::debug!("bucket heap: segment limit {} reached", self.slots.len());
            return None;
        }
        // Over-reserve by one page and align up.
        let len = self.span.checked_add(PAGE_LEN)?;
        // Safety: FFI call to reserve memory.
        let raw = match unsafe { V::reserve(len) } {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("bucket heap: segment reservation of {len} bytes failed: {e}");
                return None;
            }
        };
        stats::TOTAL_RESERVED.add(len);

        let base = (raw.as_ptr() as usize).next_multiple_of(PAGE_LEN);
        let segment = self.reserved;
        let slot = &mut self.slots[segment];
        slot.reservation = Some((raw, len));
        slot.base = base;
        self.reserved += 1;
        map.publish(base);
        debug_assert_eq!(map.base(segment), base);
        log::debug!(
            "bucket heap: reserved segment {segment} at {base:#x} ({} pages)",
            self.pages_per_segment()
        );
        Some(segment)
    }

    /// Commit the next unmapped page after the segment's last-mapped cursor,
    /// wrapping around.  Returns the page base.
    pub(crate) fn acquire_page(&mut self, segment: usize) -> Option<NonNull<u8>> {
        let slot = &mut self.slots[segment];
        let pages = slot.pages.0.len();
        let page = slot.pages.find_next_unset_from((slot.last_mapped + 1) % pages)?;
        let addr = slot.base + page * PAGE_LEN;
        // Safety: addr is page-aligned and inside this slot's reservation.
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        // Safety: FFI call to commit memory.
        if let Err(e) = unsafe { V::commit(ptr, PAGE_LEN) } {
            log::warn!("bucket heap: commit of page {page} in segment {segment} failed: {e}");
            return None;
        }
        slot.pages.set(page, true);
        slot.last_mapped = page;
        slot.committed += PAGE_LEN;
        stats::TOTAL_COMMITTED.add(PAGE_LEN);
        stats::BUCKET_PAGES_COMMITTED.add(PAGE_LEN);
        log::trace!("bucket heap: mapped page {addr:#x}");
        Some(ptr)
    }

    /// Decommit the page at `page_base` and clear its bitmap bit.  `false`
    /// when the page is not a mapped page of this set or the OS refuses.
    pub(crate) fn release_page(&mut self, page_base: usize) -> bool {
        let span = self.span;
        let Some(slot) = self.slots[..self.reserved]
            .iter_mut()
            .find(|s| page_base.wrapping_sub(s.base) < span)
        else {
            return false;
        };
        let offset = page_base - slot.base;
        let page = offset / PAGE_LEN;
        if !offset.is_multiple_of(PAGE_LEN) || !slot.pages.is_set(page) {
            return false;
        }
        // Safety: page is a mapped, page-aligned address inside the slot.
        let ptr = unsafe { NonNull::new_unchecked(page_base as *mut u8) };
        // Safety: FFI call to decommit memory; no live items remain.
        if let Err(e) = unsafe { V::decommit(ptr, PAGE_LEN) } {
            log::warn!("bucket heap: decommit of page {page_base:#x} failed: {e}");
            return false;
        }
        slot.pages.set(page, false);
        slot.committed -= PAGE_LEN;
        stats::sub_saturating(&stats::TOTAL_COMMITTED, PAGE_LEN);
        stats::sub_saturating(&stats::BUCKET_PAGES_COMMITTED, PAGE_LEN);
        log::trace!("bucket heap: unmapped page {page_base:#x}");
        true
    }
}

impl<V: VmOps> Drop for SegmentSet<V> {
    fn drop(&mut self) {
        for slot in &mut self.slots[..self.reserved] {
            stats::sub_saturating(&stats::TOTAL_COMMITTED, slot.committed);
            stats::sub_saturating(&stats::BUCKET_PAGES_COMMITTED, slot.committed);
            slot.committed = 0;
            slot.pages.clear();
            if let Some((raw, len)) = slot.reservation.take() {
                // Safety: FFI call to release; (raw, len) is the exact
                // reservation returned by V::reserve.
                if let Err(e) = unsafe { V::release(raw, len) } {
                    log::warn!("bucket heap: segment release failed: {e}");
                }
                stats::sub_saturating(&stats::TOTAL_RESERVED, len);
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::PlatformVmOps;

    #[test]
    fn test_find_next_unset_wraps() {
        let mut bits = PageBitmap::new(8);
        assert_eq!(bits.find_next_unset_from(0), Some(0));
        for page in [0, 1, 5, 6, 7] {
            bits.set(page, true);
        }
        assert_eq!(bits.find_next_unset_from(3), Some(3));
        assert_eq!(bits.find_next_unset_from(5), Some(2));
        assert_eq!(bits.count_set(), 5);
        for page in 0..8 {
            bits.set(page, true);
        }
        assert_eq!(bits.find_next_unset_from(4), None);
    }

    #[test]
    fn test_reserve_segment_limit() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let map = SegmentMap::new(2, 4 * PAGE_LEN);
        let mut set = SegmentSet::<PlatformVmOps>::new(2, 4 * PAGE_LEN);

        assert_eq!(set.reserve_segment(&map), Some(0));
        assert_eq!(set.reserve_segment(&map), Some(1));
        assert_eq!(set.reserve_segment(&map), None, "limit is two segments");
        assert_eq!(map.len(), 2);
        for segment in 0..2 {
            assert!(set.base(segment).is_multiple_of(PAGE_LEN));
            assert_eq!(map.base(segment), set.base(segment));
        }
    }

    #[test]
    fn test_acquire_pages_round_robin() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let map = SegmentMap::new(1, 3 * PAGE_LEN);
        let mut set = SegmentSet::<PlatformVmOps>::new(1, 3 * PAGE_LEN);
        let segment = set.reserve_segment(&map).unwrap();
        let base = set.base(segment);

        let p0 = set.acquire_page(segment).unwrap().as_ptr() as usize;
        let p1 = set.acquire_page(segment).unwrap().as_ptr() as usize;
        assert_eq!(p0, base);
        assert_eq!(p1, base + PAGE_LEN);

        // Releasing page 0 does not make it the next pick: the cursor moves on.
        assert!(set.release_page(p0));
        let p2 = set.acquire_page(segment).unwrap().as_ptr() as usize;
        assert_eq!(p2, base + 2 * PAGE_LEN);
        let p3 = set.acquire_page(segment).unwrap().as_ptr() as usize;
        assert_eq!(p3, base, "search wraps to the released page");
        assert!(set.acquire_page(segment).is_none(), "segment is full");
        assert_eq!(set.mapped_pages(), 3);

        // Safety: Test code. Mapped pages are writable.
        unsafe { (p2 as *mut u8).write(7) };
    }

    #[test]
    fn test_release_page_rejects_foreign_addresses() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let map = SegmentMap::new(1, 2 * PAGE_LEN);
        let mut set = SegmentSet::<PlatformVmOps>::new(1, 2 * PAGE_LEN);
        let segment = set.reserve_segment(&map).unwrap();
        let base = set.base(segment);

        assert!(!set.release_page(base), "page is not mapped yet");
        let page = set.acquire_page(segment).unwrap().as_ptr() as usize;
        assert!(!set.release_page(page + 8), "not a page base");
        assert!(!set.release_page(base + 4 * PAGE_LEN), "outside the segment");
        assert!(set.release_page(page));
        assert!(!set.release_page(page), "already released");
    }

    #[test]
    fn test_map_locate() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let map = SegmentMap::new(1, 2 * PAGE_LEN);
        let mut set = SegmentSet::<PlatformVmOps>::new(1, 2 * PAGE_LEN);
        assert!(!map.contains(0x1000));
        let segment = set.reserve_segment(&map).unwrap();
        let base = set.base(segment);
        assert_eq!(map.locate(base + PAGE_LEN + 10), Some((0, 1)));
        assert!(map.contains(base));
        assert!(!map.contains(base + 2 * PAGE_LEN));
        assert!(!map.contains(base.wrapping_sub(1)));
    }
}
