//! Allocator configuration: free-list organization, placement rule and
//! heap-growth tunables.

/// Organization of the free-block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A single LIFO list holding every free block.
    ExplicitList,
    /// Twenty size-class lists, searched in ascending class order.
    SegregatedFit,
    /// Power-of-two blocks that merge only with their address-derived
    /// buddy. No footers; predecessors are computed, not walked.
    Buddy,
}

/// Rule for choosing among acceptable free blocks.
///
/// Ignored by [`Strategy::Buddy`], which always takes the smallest
/// power-of-two class that fits and splits downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The first block that fits, in list order.
    FirstFit,
    /// The smallest block that fits; earlier-visited blocks win ties.
    BestFit,
    /// The largest block that fits; earlier-visited blocks win ties.
    WorstFit,
}

/// Allocator tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub strategy: Strategy,
    pub placement: Placement,
    /// Heap-extension granule in bytes. Placement failures extend the
    /// heap by at least this much.
    pub chunk_size: usize,
    /// Extra bytes for the very first extension only. Workloads that
    /// issue a known pair of allocations right after startup can size
    /// the first chunk to hold both.
    pub initial_extension_bias: usize,
}

impl Config {
    /// The default configuration: segregated fit, first fit, 4 KiB
    /// chunks, no first-extension bias.
    pub const fn new() -> Self {
        Self {
            strategy: Strategy::SegregatedFit,
            placement: Placement::FirstFit,
            chunk_size: 4096,
            initial_extension_bias: 0,
        }
    }

    /// The same tunables with a different organization.
    pub const fn with_strategy(strategy: Strategy) -> Self {
        let mut config = Self::new();
        config.strategy = strategy;
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
