//! Cleanup: turn fully free small blocks back into free ranges.
//!
//! A pass drains every free list, counts the free items of each small block
//! into a scratch table, and compares the count against the block's
//! capacity.  Blocks whose every item is free lose their bucket; runs of
//! such blocks are rebuilt into free ranges, and pages left with nothing but
//! free blocks are decommitted.  Surviving items go back onto their bucket's
//! lists, grouped by how many passes their small block has stayed partly
//! live.
//!
//! The scratch tables live in a VM-reserved arena owned by the heap, so a
//! pass never allocates from the heap it is cleaning.

use super::bucket::{BucketAllocator, HeapState};
use super::error::CleanupError;
use super::fallback::FallbackHeap;
use super::free_list::{FreeList, for_each_node, sort_by_address};
use super::layout::{
    FreeItem, HEADER_LEN, PAGE_LEN, PageHeader, SMALL_BLOCK_LEN, SMALL_BLOCKS_PER_PAGE,
    block_capacity, block_floor, block_of, spill_len,
};
use super::trace::{ScopeGuard, TraceScope};
use super::vm::VmOps;
use crate::sync::atomic::Ordering;
use std::ptr::NonNull;

/// Scratch count marking a small block with no live item.
const FREE_BLOCK: u16 = u16::MAX;

/// Outcome of one cleanup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Pages decommitted because every small block was free.
    pub pages_released: usize,
    /// Bucket-owned small blocks found with every item free.
    pub small_blocks_reclaimed: usize,
    /// Free items dropped with their small block.
    pub items_reclaimed: usize,
    /// Free items put back on the free lists.
    pub items_retained: usize,
    /// Free ranges tracked after the pass.
    pub free_ranges: usize,
    pub free_range_bytes: usize,
}

/// Free-list generation of a small block that survived `stability` passes.
#[inline]
pub(crate) fn generation_for(stability: u8, generations: usize) -> usize {
    ((u8::BITS - stability.leading_zeros()) as usize).min(generations - 1)
}

impl<L: FreeList, V: VmOps, H: FallbackHeap> BucketAllocator<L, V, H> {
    /// One cleanup pass.  The heap lock must be held by the caller, which
    /// `&mut HeapState` witnesses.
    pub(super) fn cleanup_locked(
        &self,
        state: &mut HeapState<V>,
    ) -> Result<CleanupStats, CleanupError> {
        let _scope = ScopeGuard::enter(self.trace.as_deref(), TraceScope::Cleanup);
        let HeapState {
            segments,
            ranges,
            scratch,
        } = state;

        let pages_per_segment = segments.pages_per_segment();
        let blocks_per_segment = pages_per_segment * SMALL_BLOCKS_PER_PAGE;
        let list_count = self.lists.len();

        // Everything fallible happens before the first list is touched.
        let tables = scratch
            .as_mut()
            .ok_or(CleanupError::ScratchUnavailable)
            .and_then(|arena| {
                arena.reset();
                // Safety: the slices are dropped before this function
                // returns and the arena is not reset meanwhile.
                unsafe {
                    Ok((
                        arena.alloc_slice::<u16>(segments.len() * blocks_per_segment, 0)?,
                        arena.alloc_slice::<usize>(list_count, 0)?,
                        arena.alloc_slice::<usize>(list_count, 0)?,
                        arena.alloc_slice::<usize>(list_count, 0)?,
                    ))
                }
            })
            .inspect_err(|e| {
                log::warn!("bucket heap: cleanup skipped, memory may remain fragmented: {e}");
            });
        let (counts, drained, heads, tails) = tables?;

        let block_index = |addr: usize| -> Option<usize> {
            let (segment, page) = self.map.locate(addr)?;
            Some(segment * blocks_per_segment + page * SMALL_BLOCKS_PER_PAGE + block_of(addr))
        };
        let mut stats = CleanupStats::default();

        for (slot, list) in drained.iter_mut().zip(self.lists.iter()) {
            *slot = list.take_all().map_or(0, |head| head.as_ptr() as usize);
        }

        // Count free items per small block.
        for &head in drained.iter() {
            // Safety: drained chains are detached and owned by this pass.
            unsafe {
                for_each_node(NonNull::new(head as *mut FreeItem), |node| {
                    if let Some(index) = block_index(node.as_ptr() as usize) {
                        counts[index] = counts[index].saturating_add(1);
                    } else {
                        assert!(
                            !self.config.guard_checks,
                            "bucket heap corruption: free item {node:p} outside every segment"
                        );
                    }
                });
            }
        }

        // Blocks under a free range host no items at all.
        for (start, len) in ranges.iter() {
            let mut block = block_floor(start);
            while block < start + len {
                if let Some(index) = block_index(block) {
                    counts[index] = FREE_BLOCK;
                }
                block += SMALL_BLOCK_LEN;
            }
        }

        // Compare counts against capacity; age the blocks that stay live.
        for segment in 0..segments.len() {
            for page in 0..pages_per_segment {
                if !segments.is_page_mapped(segment, page) {
                    continue;
                }
                let page_base = segments.base(segment) + page * PAGE_LEN;
                // Safety: the page is mapped and its header initialised.
                let header = unsafe { PageHeader::of(page_base) };
                let first = segment * blocks_per_segment + page * SMALL_BLOCKS_PER_PAGE;
                for block in 0..SMALL_BLOCKS_PER_PAGE {
                    let count = &mut counts[first + block];
                    let Some(bucket) = header.bucket(block) else {
                        *count = FREE_BLOCK;
                        continue;
                    };
                    if *count == FREE_BLOCK {
                        continue;
                    }
                    let size = self.classes.size_for_bucket(bucket);
                    let capacity = block_capacity(header.base(block), size, header.spills(block));
                    let free = usize::from(*count);
                    if free == capacity {
                        *count = FREE_BLOCK;
                        stats.small_blocks_reclaimed += 1;
                    } else {
                        assert!(
                            !self.config.guard_checks || free < capacity,
                            "bucket heap corruption: small block {block} of page {page_base:#x} \
                             has {free} free items but holds {capacity}"
                        );
                        header.set_stability(block, header.stability(block).saturating_add(1));
                    }
                }
            }
        }

        // Regroup surviving items by (bucket, generation); drop the rest.
        for &head in drained.iter() {
            // Safety: drained chains are detached and owned by this pass;
            // for_each_node reads the link before the closure relinks.
            unsafe {
                for_each_node(NonNull::new(head as *mut FreeItem), |node| {
                    let addr = node.as_ptr() as usize;
                    let Some(index) = block_index(addr) else {
                        return;
                    };
                    if counts[index] == FREE_BLOCK {
                        stats.items_reclaimed += 1;
                        return;
                    }
                    let header = PageHeader::of(addr);
                    let block = block_of(addr);
                    let Some(bucket) = header.bucket(block) else {
                        return;
                    };
                    let generation = generation_for(header.stability(block), self.generations);
                    let target = self.list_index(bucket, generation);
                    node.as_ref().set_next(0);
                    if tails[target] == 0 {
                        heads[target] = addr;
                    } else {
                        (*(tails[target] as *const FreeItem)).set_next(addr);
                    }
                    tails[target] = addr;
                    stats.items_retained += 1;
                });
            }
        }

        // Rebuild the range list from runs of free blocks, page by page.
        ranges.clear();
        for segment in 0..segments.len() {
            for page in 0..pages_per_segment {
                if !segments.is_page_mapped(segment, page) {
                    continue;
                }
                let page_base = segments.base(segment) + page * PAGE_LEN;
                let first = segment * blocks_per_segment + page * SMALL_BLOCKS_PER_PAGE;
                let page_counts = &counts[first..first + SMALL_BLOCKS_PER_PAGE];

                if page_counts.iter().all(|&c| c == FREE_BLOCK) && segments.release_page(page_base)
                {
                    self.heap_size.fetch_sub(PAGE_LEN, Ordering::Relaxed);
                    if let Some(trace) = self.trace.as_deref() {
                        trace.on_page_unmap(page_base, PAGE_LEN);
                    }
                    stats.pages_released += 1;
                    continue;
                }

                // Safety: the page is still mapped.
                let header = unsafe { PageHeader::of(page_base) };
                let mut run_start = None;
                for block in 0..=SMALL_BLOCKS_PER_PAGE {
                    let free = block < SMALL_BLOCKS_PER_PAGE && page_counts[block] == FREE_BLOCK;
                    if free {
                        if run_start.is_none() {
                            let skip = if block == 0 {
                                HEADER_LEN
                            } else if let Some(prev) = header.bucket(block - 1)
                                && header.spills(block - 1)
                            {
                                spill_len(header.base(block - 1), self.classes.size_for_bucket(prev))
                            } else {
                                0
                            };
                            run_start = Some((block, page_base + block * SMALL_BLOCK_LEN + skip));
                        }
                    } else if let Some((first_block, start)) = run_start.take() {
                        for freed in first_block..block {
                            header.reset_block(freed);
                        }
                        let end = page_base + block * SMALL_BLOCK_LEN;
                        // Safety: every byte of the run is free and owned by
                        // the heap; the lock is held.
                        unsafe { ranges.insert(start, end - start) };
                    }
                }
            }
        }

        for target in 0..list_count {
            let (Some(head), Some(tail)) = (
                NonNull::new(heads[target] as *mut FreeItem),
                NonNull::new(tails[target] as *mut FreeItem),
            ) else {
                continue;
            };
            // Safety: the chain was rebuilt above and is owned by this pass.
            unsafe {
                let (head, tail) = if self.config.sort_free_lists {
                    sort_by_address(head)
                } else {
                    (head, tail)
                };
                self.lists[target].push_chain(head, tail);
            }
        }

        stats.free_ranges = ranges.len();
        stats.free_range_bytes = ranges.total_bytes();
        Ok(stats)
    }
}
