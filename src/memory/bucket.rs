//! The bucket allocator facade.
//!
//! Requests up to `max_size` are served from per-bucket intrusive free lists
//! carved out of 64 KiB pages inside reserved segments.  Everything else is
//! forwarded to the fallback heap.  The fast paths (pop on allocate, push on
//! deallocate) take no lock; refill and cleanup serialise on one heap mutex.

use super::cleanup::CleanupStats;
use super::config::BucketAllocatorConfig;
use super::error::{AllocError, CleanupError};
use super::fallback::{FallbackHeap, SystemHeap};
use super::free_list::{AtomicFreeList, FreeList, LocalFreeList};
use super::free_range::FreeRangeList;
use super::layout::{FreeItem, PageHeader, SMALL_BLOCKS_PER_PAGE, block_floor, block_of};
use super::scratch::ScratchArena;
use super::segment::{SegmentMap, SegmentSet};
use super::size_class::SizeClasses;
use super::trace::AllocTrace;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::{Mutex, MutexGuard, OnceLock};
use std::ptr::NonNull;
use std::sync::PoisonError;

/// State only touched by refill and cleanup, under the heap lock.
pub(super) struct HeapState<V: VmOps> {
    pub(super) segments: SegmentSet<V>,
    pub(super) ranges: FreeRangeList,
    pub(super) scratch: Option<ScratchArena<V>>,
}

/// Segmented bucket allocator for small objects.
///
/// `L` picks the free-list synchronization policy, `V` the OS virtual-memory
/// interface and `H` the heap that serves everything outside the buckets.
pub struct BucketAllocator<
    L: FreeList = AtomicFreeList,
    V: VmOps = PlatformVmOps,
    H: FallbackHeap = SystemHeap,
> {
    pub(super) config: BucketAllocatorConfig,
    pub(super) classes: SizeClasses,
    pub(super) generations: usize,
    /// One list per (bucket, generation), bucket-major.
    pub(super) lists: Box<[L]>,
    pub(super) map: SegmentMap,
    pub(super) state: Mutex<HeapState<V>>,
    pub(super) heap_size: AtomicUsize,
    pub(super) trace: Option<Box<dyn AllocTrace>>,
    consumed: AtomicUsize,
    expand_cleanups: AtomicBool,
    fallback: H,
}

/// Single-thread instance: free lists without atomics.
pub type LocalBucketAllocator = BucketAllocator<LocalFreeList>;

impl BucketAllocator {
    /// Create a new `BucketAllocator` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if the scratch reservation fails.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(BucketAllocatorConfig::default())
    }

    /// Create a new `BucketAllocator` with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Config` for an invalid configuration and
    /// `AllocError::Vm` if the scratch reservation fails.
    pub fn with_config(config: BucketAllocatorConfig) -> Result<Self, AllocError> {
        Self::with_parts(config, SystemHeap)
    }
}

impl<L: FreeList, V: VmOps, H: FallbackHeap> BucketAllocator<L, V, H> {
    /// Create an allocator with an explicit fallback heap.  Segments are
    /// reserved lazily, on the first refill that needs a page.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Config` for an invalid configuration and
    /// `AllocError::Vm` if the scratch reservation fails.
    pub fn with_parts(config: BucketAllocatorConfig, fallback: H) -> Result<Self, AllocError> {
        config.validate()?;
        let classes = SizeClasses::new(&config);
        let generations = config.num_generations;
        let lists: Box<[L]> = (0..classes.count() * generations).map(|_| L::default()).collect();
        let span = config.segment_capacity;

        let scratch_capacity = if config.scratch_capacity == 0 {
            Self::scratch_needed(&config, lists.len())
        } else {
            config.scratch_capacity
        };
        let scratch = ScratchArena::new(scratch_capacity)?;

        log::debug!(
            "bucket heap: {} buckets of {}..={} bytes, {} generations, up to {} segments of {} bytes",
            classes.count(),
            classes.size_for_bucket(0),
            classes.max_size(),
            generations,
            config.max_segments,
            span
        );

        Ok(Self {
            classes,
            generations,
            lists,
            map: SegmentMap::new(config.max_segments, span),
            state: Mutex::new(HeapState {
                segments: SegmentSet::new(config.max_segments, span),
                ranges: FreeRangeList::default(),
                scratch: Some(scratch),
            }),
            heap_size: AtomicUsize::new(0),
            trace: None,
            consumed: AtomicUsize::new(0),
            expand_cleanups: AtomicBool::new(config.auto_cleanup),
            fallback,
            config,
        })
    }

    /// Scratch bytes a cleanup pass needs with every segment reserved.
    fn scratch_needed(config: &BucketAllocatorConfig, lists: usize) -> usize {
        let blocks = config.max_segments * config.pages_per_segment() * SMALL_BLOCKS_PER_PAGE;
        blocks * size_of::<u16>() + 3 * lists * size_of::<usize>() + 64
    }

    /// Attach an allocation recorder.
    #[must_use]
    pub fn with_trace(mut self, trace: Box<dyn AllocTrace>) -> Self {
        self.trace = Some(trace);
        self
    }

    #[inline]
    pub fn config(&self) -> &BucketAllocatorConfig {
        &self.config
    }

    #[inline]
    pub fn size_classes(&self) -> &SizeClasses {
        &self.classes
    }

    #[inline]
    pub(super) fn list_index(&self, bucket: usize, generation: usize) -> usize {
        bucket * self.generations + generation
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, HeapState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop from the most stable generation that has an item.
    pub(super) fn pop_bucket(&self, bucket: usize) -> Option<NonNull<FreeItem>> {
        let first = self.list_index(bucket, 0);
        let lists = &self.lists[first..first + self.generations];
        for list in lists.iter().rev() {
            if list.is_empty() {
                continue;
            }
            if let Some(item) = list.pop() {
                if self.config.guard_checks {
                    // Safety: a popped node is exclusively ours.
                    let intact = unsafe { item.as_ref() }.guard_intact();
                    assert!(intact, "bucket heap: free-list corruption at {item:p}");
                }
                return Some(item);
            }
        }
        None
    }

    /// Allocate `size` bytes at the natural alignment of the bucket that
    /// fits, or from the fallback heap above `max_size`.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.classes.bucket_for_size(size) {
            Some(bucket) => self.allocate_from_bucket(bucket, self.classes.natural_alignment(bucket)),
            None => self.allocate_fallback(size, None),
        }
    }

    /// Allocate `size` bytes aligned to `align`.  Requests no bucket can
    /// align go to the fallback heap.  `None` for a non-power-of-two `align`.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        match self.classes.bucket_for_request(size, align) {
            Some(bucket) => self.allocate_from_bucket(bucket, align),
            None => self.allocate_fallback(size, Some(align)),
        }
    }

    /// Like [`allocate_aligned`](Self::allocate_aligned) but never touches
    /// the fallback heap: `None` when no bucket fits.
    pub fn allocate_in_buckets(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        let bucket = self.classes.bucket_for_request(size, align)?;
        self.allocate_from_bucket(bucket, align)
    }

    fn allocate_from_bucket(&self, bucket: usize, align: usize) -> Option<NonNull<u8>> {
        let item = match self.pop_bucket(bucket) {
            Some(item) => item,
            None => self.refill(bucket)?,
        };
        let size = self.classes.size_for_bucket(bucket);
        if self.config.guard_checks {
            // Safety: the item was just detached from every list.
            unsafe { FreeItem::clear_guard(item) };
        }
        let ptr = item.cast::<u8>();
        debug_assert!((ptr.as_ptr() as usize).is_multiple_of(align));
        if let Some(fill) = self.config.fill_on_alloc {
            // Safety: the whole item belongs to the caller now.
            unsafe { ptr.as_ptr().write_bytes(fill, size) };
        }
        if self.config.track_consumed_bytes {
            self.consumed.fetch_add(size, Ordering::Relaxed);
        }
        if let Some(trace) = self.trace.as_deref() {
            trace.on_alloc(ptr.as_ptr() as usize, size, Some(bucket), align);
        }
        Some(ptr)
    }

    fn allocate_fallback(&self, size: usize, align: Option<usize>) -> Option<NonNull<u8>> {
        if !self.config.allow_fallback {
            return None;
        }
        let ptr = match align {
            Some(align) => self.fallback.alloc_aligned(size, align),
            None => self.fallback.alloc(size),
        }?;
        if let Some(trace) = self.trace.as_deref() {
            trace.on_alloc(ptr.as_ptr() as usize, size, None, align.unwrap_or(1));
        }
        Some(ptr)
    }

    /// Return a block and report its usable size.
    ///
    /// Blocks outside every segment go to the fallback heap.  With
    /// `guard_checks` on, a double free, a pointer into the middle of an
    /// item, or a foreign pointer with the fallback disabled panics.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        if !self.map.contains(addr) {
            if self.config.allow_fallback {
                // Safety: upheld by caller; the block is not ours.
                let size = unsafe { self.fallback.free(ptr) };
                if let Some(trace) = self.trace.as_deref() {
                    trace.on_free(addr, size);
                }
                return size;
            }
            assert!(
                !self.config.guard_checks,
                "bucket heap: {ptr:p} does not belong to this allocator"
            );
            return 0;
        }

        // Safety: a live item keeps its page committed.
        let header = unsafe { PageHeader::of(addr) };
        let block = block_of(addr);
        let Some(bucket) = header.bucket(block) else {
            assert!(
                !self.config.guard_checks,
                "bucket heap: {ptr:p} lies in a small block no bucket owns"
            );
            return 0;
        };
        let size = self.classes.size_for_bucket(bucket);

        if self.config.guard_checks {
            let offset = addr - block_floor(addr);
            let base = header.base(block);
            assert!(
                offset >= base && (offset - base).is_multiple_of(size),
                "bucket heap: {ptr:p} is not the start of a {size}-byte item"
            );
            // Safety: addr is an item start in a committed page.
            let already_free = unsafe { FreeItem::looks_free(addr) };
            assert!(!already_free, "bucket heap: double free of {ptr:p}");
        }

        if let Some(fill) = self.config.fill_on_free {
            // Safety: the item is owned by the caller until pushed.
            unsafe { ptr.as_ptr().write_bytes(fill, size) };
        }
        // Safety: the item is owned by the caller until pushed.
        unsafe {
            let item = FreeItem::write(ptr, 0);
            self.lists[self.list_index(bucket, 0)].push(item);
        }
        if self.config.track_consumed_bytes {
            self.consumed.fetch_sub(size, Ordering::Relaxed);
        }
        if let Some(trace) = self.trace.as_deref() {
            trace.on_free(addr, size);
        }
        size
    }

    /// Usable size of a live block: the bucket item size, or whatever the
    /// fallback heap reports.
    ///
    /// # Safety
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn get_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        if !self.map.contains(addr) {
            // Safety: upheld by caller.
            return unsafe { self.fallback.size_of(ptr) };
        }
        // Safety: a live item keeps its page committed.
        let header = unsafe { PageHeader::of(addr) };
        header
            .bucket(block_of(addr))
            .map_or(0, |bucket| self.classes.size_for_bucket(bucket))
    }

    /// Whether `ptr` lies inside a segment reserved by this allocator.
    #[inline]
    pub fn is_in_address_range(&self, ptr: *const u8) -> bool {
        self.map.contains(ptr as usize)
    }

    /// Return fully free small blocks to the free ranges, decommit pages
    /// that became empty, and re-sort the free lists by stability.
    ///
    /// # Errors
    ///
    /// Returns `CleanupError` when the scratch tables cannot be set up.  The
    /// allocator is unchanged in that case.
    pub fn cleanup(&self) -> Result<CleanupStats, CleanupError> {
        let mut state = self.lock_state();
        let stats = self.cleanup_locked(&mut state)?;
        log::debug!("bucket heap: cleanup {stats:?}");
        Ok(stats)
    }

    /// Let refill run one cleanup pass before committing a new page.
    pub fn enable_expand_cleanups(&self, enabled: bool) {
        self.expand_cleanups.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn expand_cleanups_enabled(&self) -> bool {
        self.expand_cleanups.load(Ordering::Relaxed)
    }

    /// Bytes of bucket pages currently committed.
    #[inline]
    pub fn get_heap_size(&self) -> usize {
        self.heap_size.load(Ordering::Relaxed)
    }

    /// Bytes of live bucket items.  Always 0 unless `track_consumed_bytes`
    /// is on.
    #[inline]
    pub fn consumed_bytes(&self) -> usize {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Bytes tracked as uncarved free ranges.
    pub fn free_range_bytes(&self) -> usize {
        self.lock_state().ranges.total_bytes()
    }

    /// Segments reserved so far.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.map.len()
    }
}

impl<L: FreeList, V: VmOps, H: FallbackHeap> Drop for BucketAllocator<L, V, H> {
    fn drop(&mut self) {
        let mut state = self.lock_state();
        if self.config.release_on_drop {
            match self.cleanup_locked(&mut state) {
                Ok(stats) => log::debug!("bucket heap: final cleanup {stats:?}"),
                Err(e) => log::warn!("bucket heap: final cleanup failed: {e}"),
            }
            // Dropping the segment set releases every reservation.
            return;
        }
        // Outstanding items keep pointing into the segments, so leave the
        // address space mapped.
        let span = self.config.segment_capacity;
        std::mem::forget(std::mem::replace(&mut state.segments, SegmentSet::new(0, span)));
    }
}

static GLOBAL_BUCKET_INSTANCE: OnceLock<BucketAllocator> = OnceLock::new();

/// Process-wide instance behind [`std::alloc::GlobalAlloc`].
///
/// Only layouts a bucket can serve use the bucket heap; everything else, and
/// every allocation made before [`init`](Self::init), goes to
/// [`std::alloc::System`].  Refill and cleanup run under the heap lock, so a
/// trace recorder or logger installed alongside must not allocate.
pub struct GlobalBucketAllocator;

impl GlobalBucketAllocator {
    /// Initialize the global allocator.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::AlreadyInitialized` on a second call, or the
    /// construction error of the instance.
    pub fn init(config: BucketAllocatorConfig) -> Result<(), AllocError> {
        GLOBAL_BUCKET_INSTANCE
            .set(BucketAllocator::with_config(config)?)
            .map_err(|_| AllocError::AlreadyInitialized)
    }

    /// Returns a reference to the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if the global allocator has not been initialized via [`init`](Self::init).
    pub fn get() -> &'static BucketAllocator {
        GLOBAL_BUCKET_INSTANCE
            .get()
            .expect("GlobalBucketAllocator not initialized")
    }

    #[inline]
    pub fn try_get() -> Option<&'static BucketAllocator> {
        GLOBAL_BUCKET_INSTANCE.get()
    }

    /// Run a cleanup pass on the global instance, if there is one.
    pub fn cleanup() -> Option<Result<CleanupStats, CleanupError>> {
        Self::try_get().map(BucketAllocator::cleanup)
    }
}

// Safety: bucket items are aligned to at least the requested alignment and
// sized for the layout; everything else is delegated to System with the
// caller's layout.
unsafe impl std::alloc::GlobalAlloc for GlobalBucketAllocator {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if let Some(heap) = Self::try_get()
            && let Some(ptr) = heap.allocate_in_buckets(layout.size(), layout.align())
        {
            return ptr.as_ptr();
        }
        // Safety: forwarded with the caller's layout.
        unsafe { std::alloc::System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: std::alloc::Layout) {
        if let Some(heap) = Self::try_get()
            && let Some(nn) = NonNull::new(ptr)
            && heap.is_in_address_range(ptr)
        {
            // Safety: the pointer came from this heap's buckets.
            unsafe { heap.deallocate(nn) };
            return;
        }
        // Safety: anything outside the segments came from System.
        unsafe { std::alloc::System.dealloc(ptr, layout) }
    }
}
