#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::bucket::{BucketAllocator, GlobalBucketAllocator, LocalBucketAllocator};
    use crate::memory::config::BucketAllocatorConfig;
    use crate::memory::error::{AllocError, CleanupError};
    use crate::memory::fallback::SystemHeap;
    use crate::memory::free_list::AtomicFreeList;
    use crate::memory::layout::{PAGE_LEN, page_of};
    use crate::memory::manager::MemoryManager;
    use crate::memory::trace::TraceScope;
    use crate::memory::trace::recorder::{Event, Recorder};
    use crate::memory::vm::{PlatformVmOps, VmError, VmOps};
    use crate::sync::Arc;
    use crate::sync::thread;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::ptr::NonNull;

    fn pages(n: usize, segments: usize) -> BucketAllocatorConfig {
        BucketAllocatorConfig {
            segment_capacity: n * PAGE_LEN,
            max_segments: segments,
            guard_checks: true,
            track_consumed_bytes: true,
            ..Default::default()
        }
    }

    /// Stamp every byte of an item with a tag derived from its address.
    unsafe fn stamp(p: NonNull<u8>, size: usize) {
        let tag = (p.as_ptr() as usize >> 3) as u8;
        // Safety: upheld by caller.
        unsafe { p.as_ptr().write_bytes(tag, size) };
    }

    unsafe fn stamp_intact(p: NonNull<u8>, size: usize) -> bool {
        let tag = (p.as_ptr() as usize >> 3) as u8;
        // Safety: upheld by caller.
        unsafe { std::slice::from_raw_parts(p.as_ptr(), size) }
            .iter()
            .all(|&b| b == tag)
    }

    #[test]
    fn test_two_page_segment_reclaims_a_page() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = BucketAllocator::with_config(pages(2, 1)).unwrap();

        let mut ptrs = Vec::new();
        while let Some(p) = heap.allocate(32) {
            // Safety: Test code.
            unsafe { stamp(p, 32) };
            ptrs.push(p);
        }
        assert_eq!(heap.get_heap_size(), 2 * PAGE_LEN);
        assert_eq!(heap.segment_count(), 1);
        assert!(ptrs.len() > 2 * (PAGE_LEN / 64));

        // Free every item of the second page mapped.
        let second = page_of(ptrs.last().unwrap().as_ptr() as usize);
        let (freed, live): (Vec<_>, Vec<_>) = ptrs
            .into_iter()
            .partition(|p| page_of(p.as_ptr() as usize) == second);
        assert!(!live.is_empty());
        for p in freed {
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }

        let stats = heap.cleanup().unwrap();
        assert!(stats.pages_released >= 1);
        assert_eq!(heap.get_heap_size(), PAGE_LEN);
        assert_eq!(heap.consumed_bytes(), live.len() * 32);
        for &p in &live {
            // Safety: Test code.
            unsafe {
                assert!(stamp_intact(p, 32), "live item {p:p} changed by cleanup");
                assert_eq!(heap.get_size(p), 32);
            }
        }

        // The released page is usable again.
        let again = heap.allocate(32).unwrap();
        assert_eq!(page_of(again.as_ptr() as usize), second);
        assert_eq!(heap.get_heap_size(), 2 * PAGE_LEN);
    }

    #[test]
    fn test_oversized_without_fallback_fails() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = BucketAllocator::with_config(BucketAllocatorConfig {
            allow_fallback: false,
            ..pages(4, 1)
        })
        .unwrap();
        assert!(heap.allocate(heap.size_classes().max_size() + 1).is_none());
        assert!(heap.allocate_aligned(16, 8192).is_none());
        assert_eq!(heap.segment_count(), 0);
        assert_eq!(heap.get_heap_size(), 0);
        assert_eq!(heap.free_range_bytes(), 0);
    }

    #[test]
    fn test_unsatisfiable_alignment_uses_fallback() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = BucketAllocator::with_config(pages(4, 1)).unwrap();
        let p = heap.allocate_aligned(64, 2 * PAGE_LEN).unwrap();
        assert!(!heap.is_in_address_range(p.as_ptr()));
        assert!((p.as_ptr() as usize).is_multiple_of(2 * PAGE_LEN));
        assert_eq!(heap.get_heap_size(), 0);
        // Safety: Test code.
        unsafe {
            assert_eq!(heap.get_size(p), 64);
            assert_eq!(heap.deallocate(p), 64);
        }
    }

    #[test]
    fn test_concurrent_random_stress() {
        const THREADS: usize = 4;
        const OPS: usize = 5_000;

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = Arc::new(BucketAllocator::with_config(pages(64, 2)).unwrap());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = heap.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(0xB0C4 + t as u64);
                    let mut held: Vec<(usize, usize)> = Vec::new();
                    for _ in 0..OPS {
                        if held.is_empty() || rng.gen_bool(0.55) {
                            let size = rng.gen_range(1..=700);
                            let p = heap.allocate(size).unwrap();
                            // Safety: Test code.
                            unsafe { stamp(p, size) };
                            held.push((p.as_ptr() as usize, size));
                        } else {
                            let (addr, size) = held.swap_remove(rng.gen_range(0..held.len()));
                            let p = NonNull::new(addr as *mut u8).unwrap();
                            // Safety: Test code.
                            unsafe {
                                assert!(stamp_intact(p, size), "item {p:p} corrupted");
                                assert!(heap.get_size(p) >= size);
                                heap.deallocate(p);
                            }
                        }
                    }
                    for (addr, size) in held {
                        let p = NonNull::new(addr as *mut u8).unwrap();
                        // Safety: Test code.
                        unsafe {
                            assert!(stamp_intact(p, size));
                            heap.deallocate(p);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(heap.consumed_bytes(), 0);
        heap.cleanup().unwrap();
        assert_eq!(heap.get_heap_size(), 0, "every page should be free after the run");
    }

    #[test]
    fn test_cleanup_during_concurrent_traffic() {
        const THREADS: usize = 3;

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = Arc::new(BucketAllocator::with_config(pages(32, 1)).unwrap());
        heap.enable_expand_cleanups(true);

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = heap.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    for _ in 0..200 {
                        let batch: Vec<_> = (0..50)
                            .map(|_| {
                                let size = rng.gen_range(8..=512);
                                let p = heap.allocate(size).unwrap();
                                // Safety: Test code.
                                unsafe { stamp(p, size) };
                                (p, size)
                            })
                            .collect();
                        for (p, size) in batch {
                            // Safety: Test code.
                            unsafe {
                                assert!(stamp_intact(p, size));
                                heap.deallocate(p);
                            }
                        }
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            heap.cleanup().unwrap();
            thread::yield_now();
        }
        for w in workers {
            w.join().unwrap();
        }
        heap.cleanup().unwrap();
        assert_eq!(heap.get_heap_size(), 0);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = BucketAllocator::with_config(pages(16, 1)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let ptrs: Vec<_> = (0..3000)
            .map(|_| {
                let size = rng.gen_range(16..=256);
                (heap.allocate(size).unwrap(), size)
            })
            .collect();
        let mut live = Vec::new();
        for (i, (p, size)) in ptrs.into_iter().enumerate() {
            if i % 3 == 0 {
                // Safety: Test code.
                unsafe { stamp(p, size) };
                live.push((p, size));
            } else {
                // Safety: Test code.
                unsafe { heap.deallocate(p) };
            }
        }

        let first = heap.cleanup().unwrap();
        let heap_size = heap.get_heap_size();
        let second = heap.cleanup().unwrap();
        assert_eq!(second.pages_released, 0);
        assert_eq!(second.small_blocks_reclaimed, 0);
        assert_eq!(second.items_reclaimed, 0);
        assert_eq!(second.items_retained, first.items_retained);
        assert_eq!(second.free_ranges, first.free_ranges);
        assert_eq!(second.free_range_bytes, first.free_range_bytes);
        assert_eq!(heap.get_heap_size(), heap_size);

        for (p, size) in live {
            // Safety: Test code.
            unsafe {
                assert!(stamp_intact(p, size));
                heap.deallocate(p);
            }
        }
    }

    #[test]
    fn test_expand_cleanups_recycles_other_bucket() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = BucketAllocator::with_config(pages(1, 1)).unwrap();
        let mut small = Vec::new();
        while let Some(p) = heap.allocate(64) {
            small.push(p);
        }
        for p in small {
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }

        // The only page is full of free 64-byte items.
        assert!(heap.allocate(200).is_none());
        heap.enable_expand_cleanups(true);
        let p = heap.allocate(200).unwrap();
        assert!(heap.is_in_address_range(p.as_ptr()));
        assert_eq!(heap.get_heap_size(), PAGE_LEN);
        // Safety: Test code.
        unsafe { heap.deallocate(p) };
    }

    #[test]
    fn test_scratch_exhaustion_leaves_heap_usable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = BucketAllocator::with_config(BucketAllocatorConfig {
            scratch_capacity: 1,
            ..pages(512, 1)
        })
        .unwrap();
        let ptrs: Vec<_> = (0..500).map(|i| heap.allocate(16 + i % 300).unwrap()).collect();
        let heap_size = heap.get_heap_size();
        for &p in &ptrs[..250] {
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }

        let err = heap.cleanup().unwrap_err();
        assert!(matches!(err, CleanupError::ScratchExhausted { .. }), "{err}");
        assert_eq!(heap.get_heap_size(), heap_size);

        // Refill-triggered cleanup fails the same way and falls through to
        // mapping pages.
        heap.enable_expand_cleanups(true);
        let more: Vec<_> = (0..2000).map(|_| heap.allocate(480).unwrap()).collect();
        for p in ptrs[250..].iter().copied().chain(more) {
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }
        assert_eq!(heap.consumed_bytes(), 0);
    }

    /// Reserves normally but refuses every commit.
    struct RefuseCommit;

    impl VmOps for RefuseCommit {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: forwarded.
            unsafe { PlatformVmOps::reserve(size) }
        }

        unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Err(VmError::CommitFailed(std::io::Error::other("commit refused")))
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded.
            unsafe { PlatformVmOps::decommit(ptr, size) }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded.
            unsafe { PlatformVmOps::release(ptr, size) }
        }

        fn page_size() -> usize {
            PlatformVmOps::page_size()
        }
    }

    #[test]
    fn test_commit_failure_reports_no_memory() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap =
            BucketAllocator::<AtomicFreeList, RefuseCommit>::with_parts(pages(4, 2), SystemHeap)
                .unwrap();
        assert!(heap.allocate(64).is_none());
        assert!(heap.allocate(64).is_none());
        assert_eq!(heap.get_heap_size(), 0);

        // The fallback heap does not depend on the segments.
        let big = heap.allocate(4096).unwrap();
        // Safety: Test code.
        unsafe { heap.deallocate(big) };

        let err = heap.cleanup().unwrap_err();
        assert!(matches!(err, CleanupError::ScratchCommit(_)));
    }

    #[test]
    fn test_trace_records_cleanup_unmap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let recorder = Recorder::default();
        let events = recorder.0.clone();
        let heap = BucketAllocator::with_config(pages(4, 1))
            .unwrap()
            .with_trace(Box::new(recorder));

        let p = heap.allocate(100).unwrap();
        let page = page_of(p.as_ptr() as usize);
        // Safety: Test code.
        unsafe { heap.deallocate(p) };
        events.lock().unwrap().clear();

        heap.cleanup().unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Enter(TraceScope::Cleanup),
                Event::Unmap(page),
                Event::Exit(TraceScope::Cleanup)
            ]
        );
    }

    #[test]
    fn test_local_allocator_cleanup() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = LocalBucketAllocator::with_parts(pages(8, 1), SystemHeap).unwrap();
        let ptrs: Vec<_> = (0..400).map(|i| heap.allocate(8 * (1 + i % 64)).unwrap()).collect();
        for p in ptrs {
            // Safety: Test code.
            unsafe { heap.deallocate(p) };
        }
        let stats = heap.cleanup().unwrap();
        assert!(stats.pages_released >= 1);
        assert_eq!(heap.get_heap_size(), 0);
    }

    #[test]
    fn test_global_allocator_routing() {
        use std::alloc::{GlobalAlloc, Layout};

        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // Other tests in the process may have initialized it already.
        let _ = GlobalBucketAllocator::init(pages(16, 1));
        assert!(matches!(
            GlobalBucketAllocator::init(pages(16, 1)),
            Err(AllocError::AlreadyInitialized)
        ));
        let heap = GlobalBucketAllocator::get();

        let small = Layout::from_size_align(48, 16).unwrap();
        let large = Layout::from_size_align(8192, 8).unwrap();
        // Safety: Test code.
        unsafe {
            let a = GlobalBucketAllocator.alloc(small);
            let b = GlobalBucketAllocator.alloc(large);
            assert!(!a.is_null() && !b.is_null());
            assert!(heap.is_in_address_range(a));
            assert!(!heap.is_in_address_range(b));
            assert!((a as usize).is_multiple_of(16));
            GlobalBucketAllocator.dealloc(a, small);
            GlobalBucketAllocator.dealloc(b, large);
        }
        assert!(MemoryManager::trim().is_some());
    }
}
