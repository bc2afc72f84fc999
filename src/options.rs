//! Engine configuration.

/// Which primary access index is built for value segments.
///
/// Both flavors are supported; the choice is static per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFlavor {
    /// Ordered on-disk B-tree (`.bt`). Required for prefix iteration
    /// over files, so it is the default.
    BTree,
    /// Salted hashed index (`.kvi`). Point lookups only.
    Hashed,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Transactions per step. Production uses `1 << 16`; tests shrink it.
    pub step_size: u64,
    /// Primary index flavor for value segments.
    pub index_flavor: IndexFlavor,
    /// Target false-positive rate for existence filters.
    pub existence_fp_rate: f64,
    /// Uncompressed block size for segment writers.
    pub segment_block_size: usize,
    /// zstd level for segment blocks.
    pub compression_level: i32,
    /// Rows deleted per prune batch before progress is persisted.
    pub prune_batch: u64,
    /// Upper bound on concurrent file-build tasks.
    pub build_workers: usize,
    /// Disabled by tests that do not exercise durability.
    pub fsync: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            step_size: 1 << 16,
            index_flavor: IndexFlavor::BTree,
            existence_fp_rate: 0.01,
            segment_block_size: 64 * 1024,
            compression_level: 1,
            prune_batch: 4096,
            build_workers: num_cpus() * 16,
            fsync: true,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
