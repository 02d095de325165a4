use std::path::PathBuf;

/// Options for [`MergeTreeStorage`](crate::MergeTreeStorage).
#[derive(Clone)]
pub struct StorageOptions {
    /// Root directory of the engine.
    pub path: PathBuf,

    /// Rows per mark (one index granule).
    pub index_granularity: usize,

    /// Size of the background merge worker pool. Also the number of merge
    /// attempts scheduled when `merge(0, ..)` is called.
    pub merging_threads: usize,

    /// A part larger than this many rows is never picked as a merge source.
    pub max_rows_to_merge_parts: usize,

    /// Hard cap on the length of one merge window.
    pub max_parts_to_merge_at_once: usize,

    /// A merge window is valid only if `max / (sum - max)` of the part sizes
    /// stays below this ratio.
    pub max_size_ratio_to_merge_parts: f64,

    /// When splitting a part across read workers, never leave a residue
    /// smaller than this many rows.
    pub min_rows_for_concurrent_read: usize,

    /// Rows per block fed into merge readers.
    pub write_block_size: usize,

    /// Plain bytes per compressed frame in column data files.
    pub compress_block_size: usize,

    /// Name of the sign column enabling collapsing merges, if any.
    pub sign_column: Option<String>,
}

impl StorageOptions {
    pub fn default_for_test(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index_granularity: 2,
            merging_threads: 2,
            max_rows_to_merge_parts: 10 * 1024 * 1024,
            max_parts_to_merge_at_once: 10,
            max_size_ratio_to_merge_parts: 5.0,
            min_rows_for_concurrent_read: 1,
            write_block_size: 65536,
            compress_block_size: 65536,
            sign_column: None,
        }
    }
}
