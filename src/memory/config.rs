use super::error::ConfigError;
use super::layout::{PAGE_LEN, SMALL_BLOCK_LEN};

/// Default reserved span of one segment.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_SEGMENT_CAPACITY: usize = 256 * 1024 * 1024;
/// Default reserved span of one segment.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_SEGMENT_CAPACITY: usize = 128 * 1024 * 1024;

/// Configuration for `BucketAllocator`. All fields have sensible defaults.
/// Validated once by `BucketAllocator::with_config()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketAllocatorConfig {
    /// Reserved VA span per segment; a multiple of the 64 KiB page.
    /// Default: 256 MiB on 64-bit targets, 128 MiB elsewhere.
    pub segment_capacity: usize,

    /// Segments this instance may reserve. Default: 4.
    pub max_segments: usize,

    /// Largest request served from buckets; bigger ones go to the fallback
    /// heap. At most half a small block. Default: 512.
    pub max_size: usize,

    /// Distance between consecutive bucket sizes; a power of two >= 8.
    /// Default: 8.
    pub alignment_step: usize,

    /// Free lists per bucket, keyed by small-block stability. Default: 4.
    pub num_generations: usize,

    /// Route oversized or over-aligned requests to the fallback heap. When
    /// false those requests fail. Default: true.
    pub allow_fallback: bool,

    /// Initial state of the expand-cleanups toggle: let refill run a cleanup
    /// pass before committing a new page. Default: false.
    pub auto_cleanup: bool,

    /// Small blocks carved per refill. Default: 2.
    pub refill_small_blocks: usize,

    /// Address-sort free lists when cleanup re-publishes them. Default: true.
    pub sort_free_lists: bool,

    /// Run a final cleanup when the allocator is dropped. Default: true.
    pub release_on_drop: bool,

    /// Trap on double free, free-list corruption and foreign pointers.
    /// Default: on in debug builds.
    pub guard_checks: bool,

    /// Byte pattern written over every item handed out. Default: none.
    pub fill_on_alloc: Option<u8>,

    /// Byte pattern written over every item returned (after the free-node
    /// words). Default: none.
    pub fill_on_free: Option<u8>,

    /// Maintain `consumed_bytes()`. Default: on in debug builds.
    pub track_consumed_bytes: bool,

    /// Reserved bytes of the cleanup scratch arena. 0 sizes it from the
    /// segment limits. Default: 0.
    pub scratch_capacity: usize,
}

impl Default for BucketAllocatorConfig {
    fn default() -> Self {
        Self {
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            max_segments: 4,
            max_size: 512,
            alignment_step: 8,
            num_generations: 4,
            allow_fallback: true,
            auto_cleanup: false,
            refill_small_blocks: 2,
            sort_free_lists: true,
            release_on_drop: true,
            guard_checks: cfg!(debug_assertions),
            fill_on_alloc: None,
            fill_on_free: None,
            track_consumed_bytes: cfg!(debug_assertions),
            scratch_capacity: 0,
        }
    }
}

impl BucketAllocatorConfig {
    /// Check every field against the fixed page geometry.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.alignment_step.is_power_of_two() || self.alignment_step < 8 {
            return Err(ConfigError::AlignmentStep(self.alignment_step));
        }
        let min = super::size_class::min_item_size(self.alignment_step);
        let limit = SMALL_BLOCK_LEN / 2;
        if self.max_size < min || self.max_size > limit {
            return Err(ConfigError::MaxSize {
                max_size: self.max_size,
                min,
                limit,
            });
        }
        let buckets = (self.max_size - min) / self.alignment_step + 1;
        if buckets >= usize::from(u8::MAX) {
            return Err(ConfigError::TooManyBuckets(buckets));
        }
        if !(1..=8).contains(&self.num_generations) {
            return Err(ConfigError::Generations(self.num_generations));
        }
        if self.segment_capacity == 0 || !self.segment_capacity.is_multiple_of(PAGE_LEN) {
            return Err(ConfigError::SegmentCapacity {
                capacity: self.segment_capacity,
                page_len: PAGE_LEN,
            });
        }
        if self.max_segments == 0 {
            return Err(ConfigError::NoSegments);
        }
        if self.refill_small_blocks == 0 {
            return Err(ConfigError::RefillSmallBlocks);
        }
        Ok(())
    }

    #[must_use]
    pub fn pages_per_segment(&self) -> usize {
        self.segment_capacity / PAGE_LEN
    }
}
