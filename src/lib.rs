//! Binned sub-allocator for offset ranges.
//!
//! Partitions a fixed abstract range `[0, size)` into non-overlapping
//! sub-ranges and hands out offsets, not pointers: the bytes live in some
//! external resource (a GPU buffer, a file, an mmap region) that the caller
//! owns. Free regions are kept in 256 segregated size-class bins behind a
//! two-level bitmap, so every operation runs in bounded time regardless of
//! how fragmented the range is.

// public module; its children stay pub(crate) and surface through the
// re-exports below
pub mod range;

// allocator
pub use range::suballoc::{AllocError, Allocation, RangeAllocator, RangeAllocatorConfig};

// reporting
pub use range::report::{FreeRegion, StorageReport, StorageReportFull};
