//! Refill: the slow path that carves free byte ranges into bucket items.
//!
//! Two carving strategies keep every small block owned by one bucket:
//!
//! * Backward, for item sizes that tile a small block.  Whole small blocks
//!   are cut from the high end of a range, so items land on multiples of
//!   their own size and never spill.  A range too short for the requested
//!   block count is consumed whole from its end.
//! * Forward, for every other size.  Items start at the (8- or 16-byte
//!   aligned) low end and run up to the requested small-block boundary;
//!   the last one may spill into the next small block, and the rest of the
//!   range starts where it ends.
//!
//! Either way a carve stays inside its range, so it never crosses a page.

use super::bucket::{BucketAllocator, HeapState};
use super::fallback::FallbackHeap;
use super::free_list::FreeList;
use super::layout::{
    FreeItem, HEADER_LEN, PAGE_LEN, PageHeader, SMALL_BLOCK_LEN, block_floor, block_of,
};
use super::trace::{ScopeGuard, TraceScope};
use super::vm::VmOps;
use crate::sync::atomic::Ordering;
use std::ptr::NonNull;

/// Where one refill cuts its items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CarvePlan {
    pub(crate) range_start: usize,
    pub(crate) region_start: usize,
    pub(crate) count: usize,
    pub(crate) item_size: usize,
    /// What is left of the range: (start, len) pairs in address order.
    /// Pieces below the tracking minimum are dropped by the range list.
    pub(crate) remainders: [(usize, usize); 2],
}

impl CarvePlan {
    #[inline]
    pub(crate) fn region_end(&self) -> usize {
        self.region_start + self.count * self.item_size
    }
}

/// Plan a carve of `want` small blocks' worth of `item_size` items out of
/// the range `[start, start + len)`.  `None` when not even one item fits.
pub(crate) fn plan_carve(
    start: usize,
    len: usize,
    item_size: usize,
    backward: bool,
    want: usize,
) -> Option<CarvePlan> {
    let end = start + len;
    debug_assert!(end.is_multiple_of(SMALL_BLOCK_LEN), "ranges end on small-block boundaries");
    if backward {
        let whole = (end - start.next_multiple_of(SMALL_BLOCK_LEN)) / SMALL_BLOCK_LEN;
        if whole >= want {
            let region_start = end - want * SMALL_BLOCK_LEN;
            return Some(CarvePlan {
                range_start: start,
                region_start,
                count: want * SMALL_BLOCK_LEN / item_size,
                item_size,
                remainders: [(start, region_start - start), (0, 0)],
            });
        }
        let count = len / item_size;
        if count == 0 {
            return None;
        }
        let region_start = end - count * item_size;
        Some(CarvePlan {
            range_start: start,
            region_start,
            count,
            item_size,
            remainders: [(start, region_start - start), (0, 0)],
        })
    } else {
        let align = if item_size.is_multiple_of(16) { 16 } else { 8 };
        let first = start.next_multiple_of(align);
        if first + item_size > end {
            return None;
        }
        let boundary = (block_floor(first) + want * SMALL_BLOCK_LEN).min(end);
        let mut count = (boundary - first).div_ceil(item_size);
        if first + count * item_size > end {
            count = (end - first) / item_size;
        }
        let region_end = first + count * item_size;
        Some(CarvePlan {
            range_start: start,
            region_start: first,
            count,
            item_size,
            remainders: [(start, first - start), (region_end, end - region_end)],
        })
    }
}

/// Items cut by one carve: the first goes to the caller, the rest form an
/// address-ordered chain for the free list.
pub(crate) struct Carved {
    pub(crate) first: NonNull<FreeItem>,
    pub(crate) rest: Option<(NonNull<FreeItem>, NonNull<FreeItem>)>,
}

/// Write page-header entries and free nodes for `plan`.
///
/// # Safety
/// The region must be committed, inside one initialised page, owned by the
/// heap and detached from the range list.  The heap lock must be held.
pub(crate) unsafe fn carve(plan: &CarvePlan, bucket: usize) -> Carved {
    let n = plan.item_size;
    let region_start = plan.region_start;
    let region_end = plan.region_end();
    debug_assert!(plan.count > 0);
    // Safety: upheld by caller.
    let header = unsafe { PageHeader::of(region_start) };

    let mut block_start = block_floor(region_start);
    while block_start < region_end {
        let block_end = block_start + SMALL_BLOCK_LEN;
        let first = if block_start <= region_start {
            region_start
        } else {
            region_start + (block_start - region_start).div_ceil(n) * n
        };
        let limit = block_end.min(region_end);
        if first >= limit {
            // Only the tail of a spilling item reaches this small block.
            break;
        }
        let last = first + (limit - 1 - first) / n * n;
        header.assign(block_of(block_start), bucket, first - block_start, last + n > block_end);
        block_start = block_end;
    }

    // Link back to front so the chain runs in address order.
    let mut next = 0usize;
    for i in (0..plan.count).rev() {
        let addr = region_start + i * n;
        // Safety: addr is an item start inside the owned region.
        let item = unsafe { FreeItem::write(NonNull::new_unchecked(addr as *mut u8), next) };
        next = item.as_ptr() as usize;
    }

    // Safety: count > 0, so region_start holds the first node.
    let first = unsafe { NonNull::new_unchecked(region_start as *mut FreeItem) };
    let rest = (plan.count > 1).then(|| {
        // Safety: both addresses hold nodes written above.
        unsafe {
            (
                NonNull::new_unchecked((region_start + n) as *mut FreeItem),
                NonNull::new_unchecked((region_end - n) as *mut FreeItem),
            )
        }
    });
    Carved { first, rest }
}

impl<L: FreeList, V: VmOps, H: FallbackHeap> BucketAllocator<L, V, H> {
    /// Slow path: every generation of `bucket` was empty.  Returns one item
    /// for the caller and publishes the rest of the carve.
    pub(super) fn refill(&self, bucket: usize) -> Option<NonNull<FreeItem>> {
        let mut state = self.lock_state();
        let _scope = ScopeGuard::enter(self.trace.as_deref(), TraceScope::Refill);

        // Another thread may have refilled while we waited for the lock.
        if let Some(item) = self.pop_bucket(bucket) {
            return Some(item);
        }

        let item_size = self.classes.size_for_bucket(bucket);
        let backward = self.classes.divides_small_block(bucket);
        let want = self.config.refill_small_blocks;
        let mut cleaned = false;
        loop {
            let plan = state
                .ranges
                .iter()
                .find_map(|(start, len)| plan_carve(start, len, item_size, backward, want));
            if let Some(plan) = plan {
                // Safety: the plan comes from a tracked range and the lock is
                // held; the remainders are detached before items are written.
                let carved = unsafe {
                    state.ranges.replace(plan.range_start, plan.remainders);
                    carve(&plan, bucket)
                };
                if let Some((head, tail)) = carved.rest {
                    // Safety: the chain was just carved and is owned here.
                    unsafe { self.lists[self.list_index(bucket, 0)].push_chain(head, tail) };
                }
                return Some(carved.first);
            }

            if !cleaned && self.expand_cleanups_enabled() {
                cleaned = true;
                match self.cleanup_locked(&mut state) {
                    Ok(stats) => log::debug!("bucket heap: refill cleanup {stats:?}"),
                    Err(e) => log::warn!("bucket heap: refill cleanup failed, memory may remain fragmented: {e}"),
                }
                if let Some(item) = self.pop_bucket(bucket) {
                    return Some(item);
                }
                continue;
            }

            if !self.map_page(&mut state) {
                log::debug!("bucket heap: no memory available for bucket {bucket} ({item_size} bytes)");
                return None;
            }
        }
    }

    /// Commit one more page, from any segment with room or a new one, and
    /// track its post-header bytes as a free range.
    fn map_page(&self, state: &mut HeapState<V>) -> bool {
        let segments = &mut state.segments;
        let page = (0..segments.len())
            .find_map(|segment| segments.acquire_page(segment))
            .or_else(|| {
                let segment = segments.reserve_segment(&self.map)?;
                segments.acquire_page(segment)
            });
        let Some(page) = page else {
            return false;
        };
        let addr = page.as_ptr() as usize;
        // Safety: the page was just committed and holds nothing yet.
        unsafe {
            PageHeader::init(addr);
            state.ranges.insert(addr + HEADER_LEN, PAGE_LEN - HEADER_LEN);
        }
        self.heap_size.fetch_add(PAGE_LEN, Ordering::Relaxed);
        if let Some(trace) = self.trace.as_deref() {
            trace.on_page_map(addr, PAGE_LEN);
        }
        true
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::layout::{MIN_RANGE_LEN, SMALL_BLOCKS_PER_PAGE, block_capacity};

    #[repr(C, align(65536))]
    struct TestPage([u8; PAGE_LEN]);

    fn page() -> Box<TestPage> {
        // Safety: Test code. All-zero bytes are a valid TestPage.
        unsafe { Box::new_zeroed().assume_init() }
    }

    const P: usize = 16 * PAGE_LEN;

    #[test]
    fn test_backward_takes_whole_blocks_from_the_end() {
        let plan = plan_carve(P + HEADER_LEN, PAGE_LEN - HEADER_LEN, 64, true, 2).unwrap();
        assert_eq!(plan.region_start, P + PAGE_LEN - 2 * SMALL_BLOCK_LEN);
        assert_eq!(plan.count, 32);
        assert_eq!(plan.region_end(), P + PAGE_LEN);
        assert_eq!(
            plan.remainders,
            [(P + HEADER_LEN, PAGE_LEN - HEADER_LEN - 2 * SMALL_BLOCK_LEN), (0, 0)]
        );
    }

    #[test]
    fn test_backward_consumes_short_range() {
        // [272, 2048): one whole block, two wanted.
        let plan = plan_carve(P + HEADER_LEN, 2048 - HEADER_LEN, 32, true, 2).unwrap();
        assert_eq!(plan.count, (2048 - HEADER_LEN) / 32);
        assert_eq!(plan.region_end(), P + 2048);
        assert!(plan.region_start - (P + HEADER_LEN) < 32);
        assert!(plan.region_start.is_multiple_of(32));
    }

    #[test]
    fn test_forward_spills_into_next_block() {
        // 48 does not tile 1024: the item crossing the boundary spills.
        let plan = plan_carve(P + 1024, 8 * 1024, 48, false, 2).unwrap();
        assert_eq!(plan.region_start, P + 1024);
        assert_eq!(plan.count, 2048_usize.div_ceil(48));
        let region_end = plan.region_end();
        assert!(region_end > P + 3 * 1024);
        assert_eq!(plan.remainders[1], (region_end, P + 9 * 1024 - region_end));
    }

    #[test]
    fn test_forward_aligns_first_item() {
        let plan = plan_carve(P + HEADER_LEN + 8, 4096 - HEADER_LEN - 8, 48, false, 1).unwrap();
        assert!(plan.region_start.is_multiple_of(16));
        let plan = plan_carve(P + HEADER_LEN + 8, 4096 - HEADER_LEN - 8, 40, false, 1).unwrap();
        assert_eq!(plan.region_start, P + HEADER_LEN + 8);
    }

    #[test]
    fn test_forward_clips_at_range_end() {
        // 600 bytes left in the last block: one 504-byte item at most, and
        // the remainder is too short to track.
        let start = P + PAGE_LEN - 600;
        let plan = plan_carve(start, 600, 504, false, 2).unwrap();
        assert_eq!(plan.count, 1);
        assert!(plan.region_end() <= P + PAGE_LEN);
        assert!(plan.remainders[1].1 < MIN_RANGE_LEN);
    }

    #[test]
    fn test_no_fit() {
        assert!(plan_carve(P + PAGE_LEN - 512, 512, 520, false, 1).is_none());
        assert!(plan_carve(P + PAGE_LEN - 100, 100, 128, true, 1).is_none());
    }

    /// Carve a whole fresh page into `n`-byte items, refill after refill, and
    /// check every header entry against the items actually written.
    fn carve_page_and_check(n: usize, backward: bool, want: usize) {
        let mut p = page();
        let base = p.0.as_mut_ptr() as usize;
        // Safety: Test code.
        let header = unsafe { PageHeader::init(base) };
        let mut ranges = crate::memory::free_range::FreeRangeList::default();
        // Safety: Test code.
        unsafe { ranges.insert(base + HEADER_LEN, PAGE_LEN - HEADER_LEN) };

        let mut starts = Vec::new();
        loop {
            let plan = ranges.iter().find_map(|(s, l)| plan_carve(s, l, n, backward, want));
            let Some(plan) = plan else { break };
            // Safety: Test code.
            unsafe {
                ranges.replace(plan.range_start, plan.remainders);
                carve(&plan, 0);
            }
            starts.extend((0..plan.count).map(|i| plan.region_start + i * n));
            assert!(plan.region_end() <= base + PAGE_LEN, "carve crossed the page");
        }

        starts.sort_unstable();
        assert!(starts.windows(2).all(|w| w[1] - w[0] >= n), "items overlap for {n}");
        for block in 0..SMALL_BLOCKS_PER_PAGE {
            let in_block = starts.iter().filter(|&&a| block_of(a) == block).count();
            match header.bucket(block) {
                Some(_) => {
                    let cap = block_capacity(header.base(block), n, header.spills(block));
                    assert_eq!(in_block, cap, "block {block} capacity mismatch for {n}");
                    let first = starts.iter().find(|&&a| block_of(a) == block).unwrap();
                    assert_eq!(first - base - block * SMALL_BLOCK_LEN, header.base(block));
                }
                None => assert_eq!(in_block, 0, "unassigned block {block} hosts items"),
            }
        }
    }

    #[test]
    fn test_carve_headers_match_items_for_every_size() {
        let classes = crate::memory::size_class::SizeClasses::new(&Default::default());
        for bucket in 0..classes.count() {
            let n = classes.size_for_bucket(bucket);
            let backward = classes.divides_small_block(bucket);
            for want in [1, 2, 3] {
                carve_page_and_check(n, backward, want);
            }
        }
    }

    #[test]
    fn test_carve_links_chain_in_address_order() {
        let mut p = page();
        let base = p.0.as_mut_ptr() as usize;
        // Safety: Test code.
        unsafe { PageHeader::init(base) };
        let plan = plan_carve(base + 1024, 2048, 256, true, 2).unwrap();
        // Safety: Test code.
        let carved = unsafe { carve(&plan, 3) };
        assert_eq!(carved.first.as_ptr() as usize, plan.region_start);
        let (head, tail) = carved.rest.unwrap();
        let mut seen = Vec::new();
        // Safety: Test code.
        unsafe {
            assert_eq!(tail.as_ref().next(), 0);
            crate::memory::free_list::for_each_node(Some(head), |node| {
                assert!(node.as_ref().guard_intact());
                seen.push(node.as_ptr() as usize);
            });
        }
        assert_eq!(seen.len(), plan.count - 1);
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 256));
        assert_eq!(*seen.last().unwrap(), tail.as_ptr() as usize);
    }
}
