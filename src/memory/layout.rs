//! Fixed page geometry and every in-place reinterpretation of heap memory.
//!
//! Three structures are overlaid on raw page bytes: the [`PageHeader`] at the
//! start of each mapped page, the [`FreeItem`] node inside every free bucket
//! item, and the [`RangeNode`] at the start of every uncarved free range.
//! Nothing outside this module casts heap addresses to typed references.
//!
//! Header fields use `std` atomics directly rather than the `sync` shim: they
//! live inside mapped pages that loom never sees.  All header stores happen
//! under the heap lock; lock-free readers (deallocate, `get_size`) only read
//! fields of small blocks that already hold their item, and ordering against
//! the writer comes from the free-list push/pop that handed the item over.

use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8 as HeaderU8, AtomicU16 as HeaderU16, AtomicU64 as HeaderU64};

/// Unit of OS commit/decommit.
pub const PAGE_LEN: usize = 64 * 1024;
/// Small blocks per page; one spill bit per block fits a `u64`.
pub const SMALL_BLOCKS_PER_PAGE: usize = 64;
/// Unit of bucket assignment.
pub const SMALL_BLOCK_LEN: usize = PAGE_LEN / SMALL_BLOCKS_PER_PAGE;
/// Free ranges shorter than this are dropped instead of tracked.
pub const MIN_RANGE_LEN: usize = SMALL_BLOCK_LEN / 2;
/// Bytes at the start of every page owned by the header.
pub const HEADER_LEN: usize = std::mem::size_of::<PageHeader>().next_multiple_of(16);

/// Header bucket id of a small block that hosts no item starts.
pub(crate) const NO_BUCKET: u8 = u8::MAX;

const GUARD_MAGIC: usize = 0xA5C3_5A3C_F00D_B0A7_u64 as usize;

#[inline]
pub(crate) const fn page_of(addr: usize) -> usize {
    addr & !(PAGE_LEN - 1)
}

#[inline]
pub(crate) const fn block_of(addr: usize) -> usize {
    (addr & (PAGE_LEN - 1)) / SMALL_BLOCK_LEN
}

#[inline]
pub(crate) const fn block_floor(addr: usize) -> usize {
    addr & !(SMALL_BLOCK_LEN - 1)
}

/// Per-page metadata, one entry per small block.
#[repr(C)]
pub(crate) struct PageHeader {
    spill: HeaderU64,
    bucket: [HeaderU8; SMALL_BLOCKS_PER_PAGE],
    stability: [HeaderU8; SMALL_BLOCKS_PER_PAGE],
    base: [HeaderU16; SMALL_BLOCKS_PER_PAGE],
}

const _: () = assert!(HEADER_LEN <= SMALL_BLOCK_LEN - MIN_RANGE_LEN);
const _: () = assert!(SMALL_BLOCK_LEN <= u16::MAX as usize);

impl PageHeader {
    /// Header of the page containing `addr`.
    ///
    /// # Safety
    /// The page must be committed and its header initialised for the whole
    /// lifetime `'a`.
    #[inline]
    pub(crate) unsafe fn of<'a>(addr: usize) -> &'a PageHeader {
        // Safety: upheld by caller; every field is an integer atomic.
        unsafe { &*(page_of(addr) as *const PageHeader) }
    }

    /// Reset the header of a freshly committed page.  Recommitted pages may
    /// hold stale bytes, so every field is written.
    ///
    /// # Safety
    /// `page` must be a committed, page-aligned address with no live items.
    pub(crate) unsafe fn init<'a>(page: usize) -> &'a PageHeader {
        // Safety: upheld by caller.
        let header = unsafe { Self::of(page) };
        header.spill.store(0, Ordering::Relaxed);
        for block in 0..SMALL_BLOCKS_PER_PAGE {
            header.reset_block(block);
        }
        header
    }

    #[inline]
    pub(crate) fn bucket(&self, block: usize) -> Option<usize> {
        match self.bucket[block].load(Ordering::Relaxed) {
            NO_BUCKET => None,
            b => Some(usize::from(b)),
        }
    }

    /// Offset inside the small block of its first item start.
    #[inline]
    pub(crate) fn base(&self, block: usize) -> usize {
        usize::from(self.base[block].load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn stability(&self, block: usize) -> u8 {
        self.stability[block].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_stability(&self, block: usize, value: u8) {
        self.stability[block].store(value, Ordering::Relaxed);
    }

    /// Whether the last item starting in `block` runs into `block + 1`.
    #[inline]
    pub(crate) fn spills(&self, block: usize) -> bool {
        self.spill.load(Ordering::Relaxed) & (1 << block) != 0
    }

    /// Hand `block` to `bucket` with items starting at `base`.
    pub(crate) fn assign(&self, block: usize, bucket: usize, base: usize, spills: bool) {
        debug_assert!(bucket < usize::from(NO_BUCKET));
        debug_assert!(base < SMALL_BLOCK_LEN);
        self.bucket[block].store(bucket as u8, Ordering::Relaxed);
        self.base[block].store(base as u16, Ordering::Relaxed);
        self.stability[block].store(0, Ordering::Relaxed);
        self.set_spill(block, spills);
    }

    pub(crate) fn reset_block(&self, block: usize) {
        self.bucket[block].store(NO_BUCKET, Ordering::Relaxed);
        self.base[block].store(0, Ordering::Relaxed);
        self.stability[block].store(0, Ordering::Relaxed);
        self.set_spill(block, false);
    }

    fn set_spill(&self, block: usize, spills: bool) {
        if spills {
            self.spill.fetch_or(1 << block, Ordering::Relaxed);
        } else {
            self.spill.fetch_and(!(1 << block), Ordering::Relaxed);
        }
    }
}

/// Item starts hosted by a small block whose items begin at `base`.
#[inline]
pub(crate) fn block_capacity(base: usize, item_size: usize, spills: bool) -> usize {
    let span = SMALL_BLOCK_LEN.saturating_sub(base);
    if spills {
        span.div_ceil(item_size)
    } else {
        span / item_size
    }
}

/// Bytes the last item of a spilling small block occupies in the next one.
#[inline]
pub(crate) fn spill_len(base: usize, item_size: usize) -> usize {
    base + block_capacity(base, item_size, true) * item_size - SMALL_BLOCK_LEN
}

/// In-place node of a free bucket item.
///
/// The guard word holds the node's own address scrambled with a constant.
/// A matching guard on an item handed to `deallocate` means it is already
/// free; a mismatch on pop means someone wrote through a freed pointer.
#[repr(C)]
pub struct FreeItem {
    next: AtomicUsize,
    guard: usize,
}

impl FreeItem {
    /// Turn the bytes at `addr` into a free node linking to `next`.
    ///
    /// # Safety
    /// `addr` must be exclusively owned, `usize`-aligned and valid for
    /// `size_of::<FreeItem>()` bytes.
    #[inline]
    pub(crate) unsafe fn write(addr: NonNull<u8>, next: usize) -> NonNull<FreeItem> {
        let item = addr.cast::<FreeItem>();
        // Safety: upheld by caller.
        unsafe {
            item.as_ptr().write(FreeItem {
                next: AtomicUsize::new(next),
                guard: Self::expected_guard(addr.as_ptr() as usize),
            });
        }
        item
    }

    #[inline]
    fn expected_guard(addr: usize) -> usize {
        addr ^ GUARD_MAGIC
    }

    #[inline]
    pub(crate) fn next(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: usize) {
        self.next.store(next, Ordering::Relaxed);
    }

    /// Whether the guard word still matches this node's address.
    #[inline]
    pub(crate) fn guard_intact(&self) -> bool {
        self.guard == Self::expected_guard(std::ptr::from_ref(self) as usize)
    }

    /// Whether the item at `addr` carries a free-node guard.
    ///
    /// # Safety
    /// `addr` must be an item start inside a committed page.
    #[inline]
    pub(crate) unsafe fn looks_free(addr: usize) -> bool {
        // Safety: upheld by caller; the guard word lies inside the item.
        let guard = unsafe {
            ((addr + std::mem::offset_of!(FreeItem, guard)) as *const usize).read()
        };
        guard == Self::expected_guard(addr)
    }

    /// Wipe the guard so a live item never looks free.
    ///
    /// # Safety
    /// `item` must be exclusively owned by the caller.
    #[inline]
    pub(crate) unsafe fn clear_guard(item: NonNull<FreeItem>) {
        // Safety: upheld by caller.
        unsafe { (*item.as_ptr()).guard = 0 };
    }
}

/// In-place header of an uncarved free byte range.  Ranges are linked by
/// address; `len` covers the header itself.
#[repr(C)]
pub(crate) struct RangeNode {
    pub(crate) prev: usize,
    pub(crate) next: usize,
    pub(crate) len: usize,
}

impl RangeNode {
    /// # Safety
    /// `start` must be committed, `usize`-aligned, and own at least
    /// `MIN_RANGE_LEN` bytes; the heap lock must be held.
    #[inline]
    pub(crate) unsafe fn write(start: usize, prev: usize, next: usize, len: usize) {
        // Safety: upheld by caller.
        unsafe { (start as *mut RangeNode).write(RangeNode { prev, next, len }) };
    }

    /// # Safety
    /// `start` must be the start of a live range; the heap lock must be held.
    #[inline]
    pub(crate) unsafe fn at<'a>(start: usize) -> &'a mut RangeNode {
        // Safety: upheld by caller.
        unsafe { &mut *(start as *mut RangeNode) }
    }
}
