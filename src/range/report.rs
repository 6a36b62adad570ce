use super::binning;
use super::suballoc::{RangeAllocator, NUM_LEAF_BINS, TOP_BINS_INDEX_SHIFT, UNUSED};

/// Coarse free-space summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageReport {
    /// Sum of all free region sizes.
    pub total_free_space: u32,
    /// Advertised size of the highest non-empty bin. A lower bound on the
    /// true largest free region, exact within round-down granularity.
    pub largest_free_region: u32,
}

/// One bin's worth of [`StorageReportFull`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeRegion {
    /// Advertised (round-down) size of the bin.
    pub size: u32,
    /// Number of free regions currently parked in the bin.
    pub count: u32,
}

/// Per-bin breakdown of free space, for fragmentation diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct StorageReportFull {
    pub free_regions: [FreeRegion; NUM_LEAF_BINS],
}

impl RangeAllocator {
    /// Free-space summary derived from the gauge and the bin masks; O(1).
    #[must_use]
    pub fn storage_report(&self) -> StorageReport {
        let mut largest_free_region = 0;
        if self.top_mask != 0 {
            let top_index = 31 - self.top_mask.leading_zeros();
            let leaf_index = 31 - u32::from(self.leaf_masks[top_index as usize]).leading_zeros();
            largest_free_region =
                binning::bin_to_size((top_index << TOP_BINS_INDEX_SHIFT) | leaf_index);
        }
        StorageReport {
            total_free_space: self.free_storage,
            largest_free_region,
        }
    }

    /// Per-bin free-region counts; walks every bin list.
    #[must_use]
    pub fn storage_report_full(&self) -> StorageReportFull {
        let mut free_regions = [FreeRegion::default(); NUM_LEAF_BINS];
        for (bin_index, region) in free_regions.iter_mut().enumerate() {
            region.size = binning::bin_to_size(bin_index as u32);
            let mut node_index = self.bin_heads[bin_index];
            while node_index != UNUSED {
                region.count += 1;
                node_index = self.nodes[node_index as usize].bin_list_next;
            }
        }
        StorageReportFull { free_regions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_allocator_reports_whole_range() {
        let total = 1u32 << 20;
        let allocator = RangeAllocator::new(total);

        let report = allocator.storage_report();
        assert_eq!(report.total_free_space, total);
        assert_eq!(report.largest_free_region, total);

        // Exactly one free region, parked in the bin representing `total`.
        let full = allocator.storage_report_full();
        let expected_bin = binning::bin_index_round_down(total) as usize;
        for (bin_index, region) in full.free_regions.iter().enumerate() {
            assert_eq!(region.size, binning::bin_to_size(bin_index as u32));
            let expected = u32::from(bin_index == expected_bin);
            assert_eq!(region.count, expected, "bin {bin_index}");
        }
    }

    #[test]
    fn test_full_report_counts_track_fragmentation() {
        let total = 1u32 << 20;
        let mut allocator = RangeAllocator::new(total);

        // Two holes plus the shrinking tail region: three free regions.
        let a = allocator.allocate(1024).unwrap();
        let pad_a = allocator.allocate(64).unwrap();
        let b = allocator.allocate(4096).unwrap();
        let pad_b = allocator.allocate(64).unwrap();
        allocator.free(a);
        allocator.free(b);

        let full = allocator.storage_report_full();
        let region_count: u32 = full.free_regions.iter().map(|region| region.count).sum();
        assert_eq!(region_count, 3);

        let coarse = allocator.storage_report();
        let binned_total: u64 = full
            .free_regions
            .iter()
            .map(|region| u64::from(region.size) * u64::from(region.count))
            .sum();
        // Round-down binning may under-report each region, never over.
        assert!(binned_total <= u64::from(coarse.total_free_space));
        assert!(coarse.largest_free_region <= coarse.total_free_space);

        allocator.free(pad_a);
        allocator.free(pad_b);
    }

    #[test]
    fn test_largest_region_is_achievable() {
        let total = 1u32 << 20;
        let mut allocator = RangeAllocator::new(total);

        let a = allocator.allocate(100_000).unwrap();
        let b = allocator.allocate(100_000).unwrap();
        allocator.free(a);

        // Whatever the report advertises must actually allocate.
        let largest = allocator.storage_report().largest_free_region;
        let c = allocator.allocate(largest).unwrap();

        allocator.free(b);
        allocator.free(c);
    }
}
