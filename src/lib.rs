pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::bucket::{BucketAllocator, GlobalBucketAllocator, LocalBucketAllocator};
pub use memory::cleanup::CleanupStats;
pub use memory::config::{BucketAllocatorConfig, DEFAULT_SEGMENT_CAPACITY};
pub use memory::size_class::SizeClasses;

// pluggable parts
pub use memory::fallback::{FallbackHeap, SystemHeap};
pub use memory::free_list::{AtomicFreeList, FreeList, LocalFreeList};
pub use memory::layout::{FreeItem, HEADER_LEN, MIN_RANGE_LEN, PAGE_LEN, SMALL_BLOCK_LEN};
pub use memory::trace::{AllocTrace, TraceScope};
pub use memory::vm::{PlatformVmOps, VmOps};

// mgmt/stats
pub use memory::manager::{MemoryManager, MemoryStats};

// errors
pub use memory::error::{AllocError, CleanupError, ConfigError};
pub use memory::vm::VmError;
