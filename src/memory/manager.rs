use super::bucket::GlobalBucketAllocator;
use super::cleanup::CleanupStats;
use super::stats;
use crate::sync::atomic::Ordering;

/// Snapshot of the process-wide memory gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub bucket_pages_committed: usize,
    pub scratch_committed: usize,
    pub fallback_live: usize,
}

/// Process-wide view over every bucket heap.
pub struct MemoryManager {}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    /// Run a cleanup pass on the global bucket heap, releasing empty pages
    /// to the OS.  `None` when the global heap is not initialized or the
    /// pass could not run.
    pub fn trim() -> Option<CleanupStats> {
        match GlobalBucketAllocator::cleanup()? {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::warn!("bucket heap: trim failed: {e}");
                None
            }
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_reserved: stats::TOTAL_RESERVED.load(Ordering::Relaxed),
            total_committed: stats::TOTAL_COMMITTED.load(Ordering::Relaxed),
            bucket_pages_committed: stats::BUCKET_PAGES_COMMITTED.load(Ordering::Relaxed),
            scratch_committed: stats::SCRATCH_COMMITTED.load(Ordering::Relaxed),
            fallback_live: stats::FALLBACK_LIVE.load(Ordering::Relaxed),
        }
    }
}
