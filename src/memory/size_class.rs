use super::config::BucketAllocatorConfig;
use super::layout::{FreeItem, SMALL_BLOCK_LEN};

/// Smallest bucket item: a free node, rounded up to the step.
#[must_use]
pub fn min_item_size(alignment_step: usize) -> usize {
    std::mem::size_of::<FreeItem>().next_multiple_of(alignment_step)
}

/// Maps request sizes to buckets: item sizes `min, min + step, ..., max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClasses {
    min: usize,
    step: usize,
    max: usize,
}

impl SizeClasses {
    /// Classifier for a validated configuration.
    #[must_use]
    pub fn new(config: &BucketAllocatorConfig) -> Self {
        let min = min_item_size(config.alignment_step);
        Self {
            min,
            step: config.alignment_step,
            // Snap to the grid so the largest bucket is exactly `max`.
            max: min + (config.max_size - min) / config.alignment_step * config.alignment_step,
        }
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        (self.max - self.min) / self.step + 1
    }

    /// Largest size served from buckets.
    #[inline]
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Smallest bucket whose items hold `size` bytes; `None` above the range.
    /// Zero-byte requests land in the first bucket.
    #[inline]
    #[must_use]
    pub fn bucket_for_size(&self, size: usize) -> Option<usize> {
        if size > self.max {
            return None;
        }
        Some((size.max(self.min) - self.min).div_ceil(self.step))
    }

    #[inline]
    #[must_use]
    pub fn size_for_bucket(&self, bucket: usize) -> usize {
        debug_assert!(bucket < self.count());
        self.min + bucket * self.step
    }

    /// Whether items of `bucket` tile a small block exactly.  Those buckets
    /// are carved backward from small-block boundaries and never spill.
    #[inline]
    #[must_use]
    pub fn divides_small_block(&self, bucket: usize) -> bool {
        SMALL_BLOCK_LEN.is_multiple_of(self.size_for_bucket(bucket))
    }

    /// Alignment every item of `bucket` has without padding.
    #[inline]
    #[must_use]
    pub fn natural_alignment(&self, bucket: usize) -> usize {
        let size = self.size_for_bucket(bucket);
        if self.divides_small_block(bucket) {
            size
        } else if size.is_multiple_of(16) {
            16
        } else {
            8
        }
    }

    /// Whether the bucket serving `size` already satisfies `align`.
    #[must_use]
    pub fn can_guarantee_alignment(&self, size: usize, align: usize) -> bool {
        self.bucket_for_size(size)
            .is_some_and(|bucket| self.natural_alignment(bucket) >= align)
    }

    /// Smallest bucket holding `size` bytes at `align`.  Walks up past the
    /// exact-fit bucket when a larger one is naturally aligned; `None` sends
    /// the request to the fallback heap.
    #[must_use]
    pub fn bucket_for_request(&self, size: usize, align: usize) -> Option<usize> {
        let first = self.bucket_for_size(size)?;
        (first..self.count()).find(|&bucket| self.natural_alignment(bucket) >= align)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn classes() -> SizeClasses {
        SizeClasses::new(&BucketAllocatorConfig::default())
    }

    #[test]
    fn test_bucket_for_size_is_minimal_cover() {
        let sc = classes();
        for size in 1..=sc.max_size() {
            let bucket = sc.bucket_for_size(size).unwrap();
            let item = sc.size_for_bucket(bucket);
            assert!(item >= size, "bucket {bucket} ({item}) too small for {size}");
            if bucket > 0 {
                assert!(
                    sc.size_for_bucket(bucket - 1) < size,
                    "bucket {bucket} not minimal for {size}"
                );
            }
        }
    }

    #[test]
    fn test_size_for_bucket_round_trip() {
        let sc = classes();
        for bucket in 0..sc.count() {
            assert_eq!(sc.bucket_for_size(sc.size_for_bucket(bucket)), Some(bucket));
        }
    }

    #[test]
    fn test_range_limits() {
        let sc = classes();
        assert_eq!(sc.max_size(), 512);
        assert_eq!(sc.bucket_for_size(0), Some(0));
        assert_eq!(sc.bucket_for_size(513), None);
        assert_eq!(sc.size_for_bucket(sc.count() - 1), 512);
        assert_eq!(sc.size_for_bucket(0), min_item_size(8));
    }

    #[test]
    fn test_natural_alignment() {
        let sc = classes();
        let of = |size| sc.natural_alignment(sc.bucket_for_size(size).unwrap());
        assert_eq!(of(64), 64);
        assert_eq!(of(256), 256);
        assert_eq!(of(48), 16);
        assert_eq!(of(40), 8);
        assert_eq!(of(512), 512);
    }

    #[test]
    fn test_alignment_requests() {
        let sc = classes();
        assert!(sc.can_guarantee_alignment(40, 8));
        assert!(!sc.can_guarantee_alignment(40, 16));
        // 40 bytes at 16: the 48-byte bucket is the first naturally 16-aligned.
        assert_eq!(sc.size_for_bucket(sc.bucket_for_request(40, 16).unwrap()), 48);
        // 40 bytes at 64: skips to the 64-byte bucket.
        assert_eq!(sc.size_for_bucket(sc.bucket_for_request(40, 64).unwrap()), 64);
        // Nothing in range is 1024-aligned.
        assert_eq!(sc.bucket_for_request(8, 1024), None);
        assert_eq!(sc.bucket_for_request(600, 8), None);
    }

    #[test]
    fn test_custom_step() {
        let sc = SizeClasses::new(&BucketAllocatorConfig {
            alignment_step: 16,
            max_size: 256,
            ..Default::default()
        });
        assert_eq!(sc.max_size(), 256);
        assert_eq!(sc.size_for_bucket(sc.bucket_for_size(17).unwrap()), 32);
    }
}
