use super::binning;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use log::trace;
use std::fmt;

pub(crate) const NUM_TOP_BINS: usize = 32;
pub(crate) const BINS_PER_LEAF: usize = 8;
pub(crate) const TOP_BINS_INDEX_SHIFT: u32 = 3;
pub(crate) const LEAF_BINS_INDEX_MASK: u32 = 0x7;
pub(crate) const NUM_LEAF_BINS: usize = NUM_TOP_BINS * BINS_PER_LEAF;

/// Sentinel standing in for "no such node" in every node-index field.
pub(crate) const UNUSED: u32 = u32::MAX;

const DEFAULT_MAX_ALLOCS: u32 = 128 * 1024;

/// Configuration for [`RangeAllocator`]. Set at init time via
/// [`RangeAllocator::with_config`].
#[derive(Clone, Debug)]
pub struct RangeAllocatorConfig {
    /// Capacity of the bookkeeping node pool. Bounds outstanding allocations
    /// plus free fragments; running out is a sizing error surfaced by
    /// [`AllocError::NodePoolExhausted`]. Default: `128 * 1024`.
    pub max_allocs: u32,
}

impl Default for RangeAllocatorConfig {
    fn default() -> Self {
        Self {
            max_allocs: DEFAULT_MAX_ALLOCS,
        }
    }
}

/// A sub-range handed out by [`RangeAllocator::allocate`].
///
/// `offset` addresses the external resource; the rest is an opaque handle
/// that must be passed back to [`RangeAllocator::free`] exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Start of the region within the managed range.
    pub offset: u32,
    /// Index of the node backing this region.
    pub(crate) metadata: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free region can satisfy the request.
    OutOfSpace { requested: u32 },
    /// Splitting the chosen region would need a bookkeeping node and the
    /// pool has none left; the range is too fragmented for the configured
    /// capacity.
    NodePoolExhausted { max_allocs: u32 },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfSpace { requested } => {
                write!(f, "no free region of {requested} bytes or more")
            }
            AllocError::NodePoolExhausted { max_allocs } => {
                write!(f, "node pool exhausted ({max_allocs} nodes)")
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// Bookkeeping record for one contiguous region of the managed range.
///
/// A node exists for every region, allocated or free. Free nodes are
/// additionally linked into the bin list of their size class. The neighbor
/// links order all nodes by offset and exist solely so that `free` can
/// reach the two physically adjacent regions in O(1).
#[derive(Clone, Copy)]
pub(crate) struct Node {
    pub(crate) data_offset: u32,
    pub(crate) data_size: u32,
    pub(crate) bin_list_prev: u32,
    pub(crate) bin_list_next: u32,
    pub(crate) neighbor_prev: u32,
    pub(crate) neighbor_next: u32,
    pub(crate) used: bool,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            data_offset: 0,
            data_size: 0,
            bin_list_prev: UNUSED,
            bin_list_next: UNUSED,
            neighbor_prev: UNUSED,
            neighbor_next: UNUSED,
            used: false,
        }
    }
}

/// Segregated-fit offset allocator over an abstract range `[0, size)`.
///
/// Free regions are binned by size class (see [`binning`](super::binning));
/// a 32-bit top mask over 32 8-bit leaf masks locates a non-empty
/// sufficient bin with two trailing-zero counts. All bookkeeping lives in a
/// pool allocated once at construction; no heap traffic happens afterwards.
///
/// Not thread-safe. Callers wrap it in their own lock if it is shared.
pub struct RangeAllocator {
    pub(crate) size: u32,
    pub(crate) free_storage: u32,

    // Bit i of `top_mask` set iff `leaf_masks[i] != 0`; bit j of
    // `leaf_masks[i]` set iff bin `i*8 + j` is non-empty.
    pub(crate) top_mask: u32,
    pub(crate) leaf_masks: [u8; NUM_TOP_BINS],
    pub(crate) bin_heads: [u32; NUM_LEAF_BINS],

    pub(crate) nodes: Box<[Node]>,
    free_nodes: Box<[u32]>,
    free_offset: u32,

    /// Node indices currently representing a region (free or used).
    /// Catches double frees and foreign handles.
    /// Only active when debug assertions are enabled.
    #[cfg(debug_assertions)]
    pub(crate) live_map: FixedBitSet,
}

impl RangeAllocator {
    /// Create an allocator managing the abstract range `[0, size)` with the
    /// default node-pool capacity.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self::with_config(size, RangeAllocatorConfig::default())
    }

    /// Create an allocator with explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `config.max_allocs` is zero.
    #[must_use]
    pub fn with_config(size: u32, config: RangeAllocatorConfig) -> Self {
        assert!(size > 0, "managed range must be non-empty");
        let max_allocs = config.max_allocs;
        assert!(max_allocs >= 1, "node pool needs at least one node");

        // Freelist is a stack, prefilled in inverse order so the first pop
        // hands out node 0. Keeps handle values stable run to run.
        let free_nodes: Box<[u32]> = (0..max_allocs).rev().collect();

        let mut allocator = Self {
            size,
            free_storage: 0,
            top_mask: 0,
            leaf_masks: [0; NUM_TOP_BINS],
            bin_heads: [UNUSED; NUM_LEAF_BINS],
            nodes: vec![Node::default(); max_allocs as usize].into_boxed_slice(),
            free_nodes,
            free_offset: max_allocs - 1,
            #[cfg(debug_assertions)]
            live_map: FixedBitSet::with_capacity(max_allocs as usize),
        };

        // Start state: the whole range as one free node. Allocation splits
        // remainders off it; frees push coalesced nodes back.
        allocator.insert_node_into_bin(size, 0);

        allocator
    }

    /// Total managed range.
    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.size
    }

    /// Carve a sub-range of `size` out of the managed range.
    ///
    /// The returned offset starts a region disjoint from every other
    /// outstanding allocation. `size == 0` is allowed and yields a
    /// zero-length region at a valid offset; `free` still recovers it.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfSpace`] when no sufficient free region exists,
    /// [`AllocError::NodePoolExhausted`] when splitting would need a node
    /// and none are left. State is unchanged on either error.
    pub fn allocate(&mut self, size: u32) -> Result<Allocation, AllocError> {
        // Round up so that any node in the found bin is guaranteed to fit
        // the request.
        let min_bin_index = binning::bin_index_round_up(size);
        let min_top_index = min_bin_index >> TOP_BINS_INDEX_SHIFT;
        let mut min_leaf_index = min_bin_index & LEAF_BINS_INDEX_MASK;

        let Some(top_index) = binning::lowest_set_bit_at_or_after(self.top_mask, min_top_index)
        else {
            return Err(AllocError::OutOfSpace { requested: size });
        };

        // A strictly higher top bin satisfies any leaf: bin sizes are
        // monotonic in the index.
        if top_index != min_top_index {
            min_leaf_index = 0;
        }

        let leaf_mask = u32::from(self.leaf_masks[top_index as usize]);
        let Some(leaf_index) = binning::lowest_set_bit_at_or_after(leaf_mask, min_leaf_index)
        else {
            return Err(AllocError::OutOfSpace { requested: size });
        };

        let bin_index = (top_index << TOP_BINS_INDEX_SHIFT) | leaf_index;

        // The bin head is popped; within a bin reuse is LIFO.
        let node_index = self.bin_heads[bin_index as usize];
        debug_assert!(node_index != UNUSED);
        let node_total_size = self.nodes[node_index as usize].data_size;
        debug_assert!(node_total_size >= size);

        // Splitting needs one fresh node. Checked before any mutation so
        // the error path leaves the allocator untouched.
        let remainder = node_total_size - size;
        if remainder > 0 && self.free_offset == UNUSED {
            return Err(AllocError::NodePoolExhausted {
                max_allocs: self.free_nodes.len() as u32,
            });
        }

        let bin_head_next = self.nodes[node_index as usize].bin_list_next;
        {
            let node = &mut self.nodes[node_index as usize];
            node.data_size = size;
            node.used = true;
        }
        self.bin_heads[bin_index as usize] = bin_head_next;
        if bin_head_next != UNUSED {
            self.nodes[bin_head_next as usize].bin_list_prev = UNUSED;
        }

        self.free_storage -= node_total_size;
        trace!(
            "free storage: {} (-{}) (allocate)",
            self.free_storage,
            node_total_size
        );

        // Bin emptied: clear its leaf bit, and the top bit with it.
        if self.bin_heads[bin_index as usize] == UNUSED {
            self.leaf_masks[top_index as usize] &= !(1 << leaf_index);
            if self.leaf_masks[top_index as usize] == 0 {
                self.top_mask &= !(1 << top_index);
            }
        }

        // Split the remainder off as a new free node directly after this one
        // in the neighbor chain, so a later free can merge them back.
        if remainder > 0 {
            let data_offset = self.nodes[node_index as usize].data_offset;
            let new_node_index = self.insert_node_into_bin(remainder, data_offset + size);

            let neighbor_next = self.nodes[node_index as usize].neighbor_next;
            if neighbor_next != UNUSED {
                self.nodes[neighbor_next as usize].neighbor_prev = new_node_index;
            }
            self.nodes[new_node_index as usize].neighbor_prev = node_index;
            self.nodes[new_node_index as usize].neighbor_next = neighbor_next;
            self.nodes[node_index as usize].neighbor_next = new_node_index;
        }

        Ok(Allocation {
            offset: self.nodes[node_index as usize].data_offset,
            metadata: node_index,
        })
    }

    /// Release a previously returned allocation, coalescing it with a free
    /// neighbor on either side.
    ///
    /// Passing a handle that was already freed or that came from another
    /// allocator corrupts bookkeeping; debug builds detect both and panic.
    pub fn free(&mut self, allocation: Allocation) {
        let node_index = allocation.metadata;

        #[cfg(debug_assertions)]
        {
            assert!(
                (node_index as usize) < self.nodes.len()
                    && self.live_map.contains(node_index as usize),
                "free of a stale or foreign handle (node {node_index})"
            );
            assert!(
                self.nodes[node_index as usize].used,
                "double free of node {node_index}"
            );
        }

        let mut offset = self.nodes[node_index as usize].data_offset;
        let mut size = self.nodes[node_index as usize].data_size;

        // Absorb a free previous neighbor: the merged region starts at its
        // offset.
        let prev_index = self.nodes[node_index as usize].neighbor_prev;
        if prev_index != UNUSED && !self.nodes[prev_index as usize].used {
            offset = self.nodes[prev_index as usize].data_offset;
            size += self.nodes[prev_index as usize].data_size;

            self.remove_node_from_bin(prev_index);

            debug_assert_eq!(self.nodes[prev_index as usize].neighbor_next, node_index);
            self.nodes[node_index as usize].neighbor_prev =
                self.nodes[prev_index as usize].neighbor_prev;
        }

        // Absorb a free next neighbor: offset stays, sizes sum.
        let next_index = self.nodes[node_index as usize].neighbor_next;
        if next_index != UNUSED && !self.nodes[next_index as usize].used {
            size += self.nodes[next_index as usize].data_size;

            self.remove_node_from_bin(next_index);

            debug_assert_eq!(self.nodes[next_index as usize].neighbor_prev, node_index);
            self.nodes[node_index as usize].neighbor_next =
                self.nodes[next_index as usize].neighbor_next;
        }

        let neighbor_next = self.nodes[node_index as usize].neighbor_next;
        let neighbor_prev = self.nodes[node_index as usize].neighbor_prev;

        trace!("returning node {node_index} to the freelist (free)");
        self.push_free_node(node_index);

        // Reinsert the coalesced region and stitch the neighbor chain
        // around it.
        let combined_index = self.insert_node_into_bin(size, offset);
        if neighbor_next != UNUSED {
            self.nodes[combined_index as usize].neighbor_next = neighbor_next;
            self.nodes[neighbor_next as usize].neighbor_prev = combined_index;
        }
        if neighbor_prev != UNUSED {
            self.nodes[combined_index as usize].neighbor_prev = neighbor_prev;
            self.nodes[neighbor_prev as usize].neighbor_next = combined_index;
        }
    }

    /// Put a free region into the bin list of its size class and return the
    /// node now representing it. Neighbor pointers are left for the caller.
    fn insert_node_into_bin(&mut self, size: u32, data_offset: u32) -> u32 {
        // Round down so the bin never advertises more than this node holds.
        let bin_index = binning::bin_index_round_down(size);
        let top_index = (bin_index >> TOP_BINS_INDEX_SHIFT) as usize;
        let leaf_index = bin_index & LEAF_BINS_INDEX_MASK;

        // First node in its bin sets the mask bits.
        if self.bin_heads[bin_index as usize] == UNUSED {
            self.leaf_masks[top_index] |= 1 << leaf_index;
            self.top_mask |= 1 << top_index;
        }

        // Take a freelist node and push it on top of the bin list.
        let top_node_index = self.bin_heads[bin_index as usize];
        let node_index = self.pop_free_node();
        self.nodes[node_index as usize] = Node {
            data_offset,
            data_size: size,
            bin_list_next: top_node_index,
            ..Node::default()
        };
        if top_node_index != UNUSED {
            self.nodes[top_node_index as usize].bin_list_prev = node_index;
        }
        self.bin_heads[bin_index as usize] = node_index;

        self.free_storage += size;
        trace!("free storage: {} (+{}) (insert)", self.free_storage, size);

        node_index
    }

    fn remove_node_from_bin(&mut self, node_index: u32) {
        let node = self.nodes[node_index as usize];

        if node.bin_list_prev != UNUSED {
            // Mid-list: splice out.
            self.nodes[node.bin_list_prev as usize].bin_list_next = node.bin_list_next;
            if node.bin_list_next != UNUSED {
                self.nodes[node.bin_list_next as usize].bin_list_prev = node.bin_list_prev;
            }
        } else {
            // Bin head: recompute the bin from the node's size.
            let bin_index = binning::bin_index_round_down(node.data_size);
            let top_index = (bin_index >> TOP_BINS_INDEX_SHIFT) as usize;
            let leaf_index = bin_index & LEAF_BINS_INDEX_MASK;

            self.bin_heads[bin_index as usize] = node.bin_list_next;
            if node.bin_list_next != UNUSED {
                self.nodes[node.bin_list_next as usize].bin_list_prev = UNUSED;
            }

            // Bin emptied: clear its leaf bit, and the top bit with it.
            if self.bin_heads[bin_index as usize] == UNUSED {
                self.leaf_masks[top_index] &= !(1 << leaf_index);
                if self.leaf_masks[top_index] == 0 {
                    self.top_mask &= !(1 << top_index);
                }
            }
        }

        self.push_free_node(node_index);

        self.free_storage -= node.data_size;
        trace!(
            "free storage: {} (-{}) (remove)",
            self.free_storage,
            node.data_size
        );
    }

    fn pop_free_node(&mut self) -> u32 {
        debug_assert!(self.free_offset != UNUSED, "node pool underflow");
        let node_index = self.free_nodes[self.free_offset as usize];
        self.free_offset = self.free_offset.wrapping_sub(1);

        #[cfg(debug_assertions)]
        self.live_map.insert(node_index as usize);

        node_index
    }

    fn push_free_node(&mut self, node_index: u32) {
        self.free_offset = self.free_offset.wrapping_add(1);
        self.free_nodes[self.free_offset as usize] = node_index;

        #[cfg(debug_assertions)]
        {
            debug_assert!(self.live_map.contains(node_index as usize));
            self.live_map.set(node_index as usize, false);
        }
    }

    /// Walk the whole structure and panic on any broken invariant.
    /// No-op in release builds; test code calls this between operations.
    #[allow(unused)]
    pub(crate) fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        {
            // Freelist entries and live nodes partition the pool.
            let max_allocs = self.free_nodes.len();
            let free_count = if self.free_offset == UNUSED {
                0
            } else {
                self.free_offset as usize + 1
            };
            let mut seen = FixedBitSet::with_capacity(max_allocs);
            for &index in &self.free_nodes[..free_count] {
                assert!(
                    !seen.contains(index as usize),
                    "freelist holds node {index} twice"
                );
                seen.insert(index as usize);
                assert!(
                    !self.live_map.contains(index as usize),
                    "node {index} is both live and on the freelist"
                );
            }
            assert_eq!(free_count + self.live_map.count_ones(..), max_allocs);

            // The neighbor chain tiles [0, size) with no two adjacent free
            // regions.
            let mut head = None;
            for index in self.live_map.ones() {
                if self.nodes[index].neighbor_prev == UNUSED {
                    assert!(head.is_none(), "neighbor chain has two heads");
                    head = Some(index as u32);
                }
            }
            let mut cursor = 0u32;
            let mut walked = 0usize;
            let mut prev_index = UNUSED;
            let mut prev_free = false;
            let mut index = head.expect("neighbor chain has no head");
            loop {
                let node = &self.nodes[index as usize];
                assert!(self.live_map.contains(index as usize));
                assert_eq!(node.neighbor_prev, prev_index);
                assert_eq!(node.data_offset, cursor, "chain does not tile the range");
                assert!(
                    !(prev_free && !node.used),
                    "two adjacent free regions left uncoalesced at {cursor}"
                );
                prev_free = !node.used;
                cursor += node.data_size;
                walked += 1;
                prev_index = index;
                index = node.neighbor_next;
                if index == UNUSED {
                    break;
                }
            }
            assert_eq!(cursor, self.size, "chain covers {cursor} of {}", self.size);
            assert_eq!(walked, self.live_map.count_ones(..));

            // Bin lists, masks, and the free-storage gauge agree.
            let mut free_total = 0u64;
            for bin_index in 0..NUM_LEAF_BINS {
                let top_index = bin_index >> TOP_BINS_INDEX_SHIFT;
                let leaf_index = bin_index as u32 & LEAF_BINS_INDEX_MASK;
                let head = self.bin_heads[bin_index];
                assert_eq!(
                    head != UNUSED,
                    self.leaf_masks[top_index] & (1 << leaf_index) != 0,
                    "leaf mask out of sync for bin {bin_index}"
                );
                assert_eq!(
                    self.leaf_masks[top_index] != 0,
                    self.top_mask & (1 << top_index) != 0,
                    "top mask out of sync for top bin {top_index}"
                );

                let mut prev = UNUSED;
                let mut node_index = head;
                while node_index != UNUSED {
                    let node = &self.nodes[node_index as usize];
                    assert!(!node.used, "used node {node_index} in bin {bin_index}");
                    assert_eq!(node.bin_list_prev, prev);
                    assert_eq!(
                        binning::bin_index_round_down(node.data_size) as usize,
                        bin_index,
                        "node {node_index} parked in the wrong bin"
                    );
                    free_total += u64::from(node.data_size);
                    prev = node_index;
                    node_index = node.bin_list_next;
                }
            }
            assert_eq!(free_total, u64::from(self.free_storage));
        }
    }
}

impl Drop for RangeAllocator {
    fn drop(&mut self) {
        // Every allocation must have been freed by now: the whole range has
        // coalesced back into the single top node.
        #[cfg(debug_assertions)]
        if !std::thread::panicking() {
            let report = self.storage_report();
            assert_eq!(report.total_free_space, self.size, "allocations leaked");
            assert_eq!(
                report.largest_free_region,
                binning::bin_to_size(binning::bin_index_round_down(self.size)),
                "range did not coalesce back into one region"
            );
        }
    }
}
