use super::error::CleanupError;
use super::stats;
use super::vm::VmOps;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Bump arena backing cleanup bookkeeping.
///
/// Reserved once when the allocator is built so a cleanup pass never calls
/// into the general-purpose heap.  Pages are committed on demand and kept
/// across passes; `reset` only rewinds the cursor.
pub(crate) struct ScratchArena<V: VmOps> {
    base: NonNull<u8>,
    cursor: usize,
    reserved: usize,
    committed: usize,
    _vm: PhantomData<fn() -> V>,
}

// Safety: ScratchArena owns its reservation; it is only used under the heap
// lock.
unsafe impl<V: VmOps> Send for ScratchArena<V> {}

impl<V: VmOps> ScratchArena<V> {
    /// Reserve `capacity` bytes, rounded up to the OS page size.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the reservation fails.
    pub(crate) fn new(capacity: usize) -> Result<Self, super::vm::VmError> {
        let capacity = capacity.max(1).next_multiple_of(V::page_size());
        // Safety: FFI call to reserve.
        let base = unsafe { V::reserve(capacity)? };
        stats::TOTAL_RESERVED.add(capacity);
        Ok(Self {
            base,
            cursor: 0,
            reserved: capacity,
            committed: 0,
            _vm: PhantomData,
        })
    }

    #[inline]
    #[allow(dead_code)]
    pub(crate) fn capacity(&self) -> usize {
        self.reserved
    }

    /// Rewind.  Everything handed out before is invalid afterwards.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }

    fn alloc_bytes(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, CleanupError> {
        let start = self.cursor.next_multiple_of(align);
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.reserved)
            .ok_or(CleanupError::ScratchExhausted {
                needed: start.saturating_add(size),
                capacity: self.reserved,
            })?;

        if end > self.committed {
            let target = end.next_multiple_of(V::page_size()).min(self.reserved);
            // Safety: committed offset is within the reservation.
            let commit_start = unsafe { self.base.add(self.committed) };
            // Safety: FFI call to commit; the range lies inside the reservation.
            unsafe { V::commit(commit_start, target - self.committed) }
                .map_err(CleanupError::ScratchCommit)?;
            stats::TOTAL_COMMITTED.add(target - self.committed);
            stats::SCRATCH_COMMITTED.add(target - self.committed);
            self.committed = target;
        }

        self.cursor = end;
        // Safety: start is within the committed range.
        Ok(unsafe { self.base.add(start) })
    }

    /// Allocate `len` copies of `fill`.
    ///
    /// # Safety
    /// The slice must not be used after the next `reset` or after the arena
    /// is dropped; the caller picks the lifetime.
    pub(crate) unsafe fn alloc_slice<'a, T: Copy>(
        &mut self,
        len: usize,
        fill: T,
    ) -> Result<&'a mut [T], CleanupError> {
        let size = std::mem::size_of::<T>()
            .checked_mul(len)
            .ok_or(CleanupError::ScratchExhausted {
                needed: usize::MAX,
                capacity: self.reserved,
            })?;
        let ptr = self.alloc_bytes(size, std::mem::align_of::<T>())?.cast::<T>();
        // Safety: ptr is committed, aligned, and valid for len elements.
        unsafe {
            for i in 0..len {
                ptr.add(i).write(fill);
            }
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), len))
        }
    }
}

impl<V: VmOps> Drop for ScratchArena<V> {
    fn drop(&mut self) {
        // Safety: FFI call to release the whole reservation.
        if let Err(e) = unsafe { V::release(self.base, self.reserved) } {
            log::warn!("bucket heap: scratch release failed: {e}");
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reserved);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, self.committed);
        stats::sub_saturating(&stats::SCRATCH_COMMITTED, self.committed);
    }
}
