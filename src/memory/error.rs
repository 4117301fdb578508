use super::vm::VmError;

/// Rejected configuration values, reported by `BucketAllocator::with_config`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("alignment step {0} must be a power of two no smaller than 8")]
    AlignmentStep(usize),
    #[error("max bucket size {max_size} must lie in {min}..={limit}")]
    MaxSize {
        max_size: usize,
        min: usize,
        limit: usize,
    },
    #[error("{0} buckets exceed the 254 a page header can name")]
    TooManyBuckets(usize),
    #[error("generation count {0} must lie in 1..=8")]
    Generations(usize),
    #[error("segment capacity {capacity} must be a non-zero multiple of the {page_len}-byte page")]
    SegmentCapacity { capacity: usize, page_len: usize },
    #[error("max segment count must be at least 1")]
    NoSegments,
    #[error("refill must carve at least one small block")]
    RefillSmallBlocks,
}

/// Construction failure.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("invalid bucket allocator configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("global bucket allocator already initialized")]
    AlreadyInitialized,
}

/// A cleanup pass that could not run.  The allocator is left exactly as it
/// was before the call; it stays usable, only more fragmented.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("cleanup scratch arena was never reserved")]
    ScratchUnavailable,
    #[error("cleanup scratch exhausted: needed {needed} bytes, capacity {capacity}")]
    ScratchExhausted { needed: usize, capacity: usize },
    #[error("cleanup scratch commit failed: {0}")]
    ScratchCommit(#[source] VmError),
}
