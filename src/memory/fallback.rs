use super::stats;
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

/// General-purpose heap serving requests outside the bucket range.
///
/// Blocks are freed and measured by address alone, so implementations keep
/// whatever bookkeeping they need next to the block.
pub trait FallbackHeap: Send + Sync {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Free a block and return its usable size.
    ///
    /// # Safety
    /// `ptr` must come from `alloc`/`alloc_aligned` on this heap and must not
    /// have been freed.
    unsafe fn free(&self, ptr: NonNull<u8>) -> usize;

    /// Usable size of a live block.
    ///
    /// # Safety
    /// `ptr` must be a live block of this heap.
    unsafe fn size_of(&self, ptr: NonNull<u8>) -> usize;
}

/// [`System`] with a `(size, align)` prefix in front of every block.
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemHeap;

const PREFIX: usize = 2 * std::mem::size_of::<usize>();

impl SystemHeap {
    /// Layout of the whole block and the offset of the user pointer.
    fn block_layout(size: usize, align: usize) -> Option<(Layout, usize)> {
        let align = align.max(std::mem::align_of::<usize>());
        let offset = PREFIX.next_multiple_of(align);
        let layout = Layout::from_size_align(offset.checked_add(size)?, align).ok()?;
        Some((layout, offset))
    }

    /// # Safety
    /// `ptr` must be a live block of this heap.
    unsafe fn prefix(ptr: NonNull<u8>) -> (usize, usize) {
        // Safety: the prefix sits right before every user pointer.
        unsafe {
            let words = ptr.as_ptr().cast::<usize>().sub(2);
            (words.read(), words.add(1).read())
        }
    }
}

impl FallbackHeap for SystemHeap {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned(size, 1)
    }

    fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        let (layout, offset) = Self::block_layout(size, align)?;
        // Safety: layout has non-zero size (it includes the prefix).
        let raw = NonNull::new(unsafe { System.alloc(layout) })?;
        // Safety: offset >= PREFIX lies inside the block, and the prefix
        // words are usize-aligned because offset is.
        unsafe {
            let user = raw.add(offset);
            let words = user.as_ptr().cast::<usize>().sub(2);
            words.write(size);
            words.add(1).write(align);
            stats::FALLBACK_LIVE.add(size);
            Some(user)
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> usize {
        // Safety: upheld by caller.
        let (size, align) = unsafe { Self::prefix(ptr) };
        let Some((layout, offset)) = Self::block_layout(size, align) else {
            unreachable!("fallback prefix at {ptr:p} was written from a valid layout");
        };
        // Safety: the block was allocated with exactly this layout.
        unsafe { System.dealloc(ptr.as_ptr().sub(offset), layout) };
        stats::sub_saturating(&stats::FALLBACK_LIVE, size);
        size
    }

    unsafe fn size_of(&self, ptr: NonNull<u8>) -> usize {
        // Safety: upheld by caller.
        unsafe { Self::prefix(ptr) }.0
    }
}
