use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

/// Per-SST discard statistics forwarded to the value log: bytes that
/// became dead in each value-log file during a compaction.
pub type DiscardStats = HashMap<u32, i64>;

/// Configuration for the LSM store.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory holding the MANIFEST, SST files, and memtable WALs.
    pub dir: PathBuf,

    /// Size at which the active memtable is rotated (default: 64MB).
    pub mem_table_size: u64,

    /// Target size of each data block inside an SST (default: 4KB).
    pub block_size: usize,

    /// False positive probability of the per-table bloom filter.
    pub bloom_false_positive: f64,

    /// Number of background compaction workers (default: 2).
    pub num_compactors: usize,

    /// L0 table count that drives the L0 compaction score to 1.0.
    pub num_level_zero_tables: usize,

    /// Total number of levels, L0 included (default: 7).
    pub max_levels: usize,

    /// Floor for per-level target sizes (default: 10MB).
    pub base_level_size: u64,

    /// Expected size ratio between adjacent levels (default: 10).
    pub level_size_multiplier: u64,

    /// Growth factor for per-level SST file sizes past the base level.
    pub table_size_multiplier: u64,

    /// SST file size at the base level (default: 2MB).
    pub base_table_size: u64,

    /// How often each compaction worker wakes up (default: 500ms).
    pub compaction_interval: Duration,

    /// Upper bound on the random startup delay of compaction workers.
    pub compaction_startup_jitter: Duration,

    /// Best-effort channel to the value log for discard statistics.
    pub discard_stats: Option<mpsc::Sender<DiscardStats>>,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            mem_table_size: 64 << 20,
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            num_compactors: 2,
            num_level_zero_tables: 5,
            max_levels: 7,
            base_level_size: 10 << 20,
            level_size_multiplier: 10,
            table_size_multiplier: 2,
            base_table_size: 2 << 20,
            compaction_interval: Duration::from_millis(500),
            compaction_startup_jitter: Duration::from_millis(1000),
            discard_stats: None,
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn mem_table_size(mut self, size: u64) -> Self {
        self.mem_table_size = size;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn bloom_false_positive(mut self, fp: f64) -> Self {
        self.bloom_false_positive = fp;
        self
    }

    pub fn num_compactors(mut self, n: usize) -> Self {
        self.num_compactors = n;
        self
    }

    pub fn num_level_zero_tables(mut self, n: usize) -> Self {
        self.num_level_zero_tables = n;
        self
    }

    pub fn max_levels(mut self, n: usize) -> Self {
        self.max_levels = n;
        self
    }

    pub fn base_level_size(mut self, size: u64) -> Self {
        self.base_level_size = size;
        self
    }

    pub fn level_size_multiplier(mut self, m: u64) -> Self {
        self.level_size_multiplier = m;
        self
    }

    pub fn table_size_multiplier(mut self, m: u64) -> Self {
        self.table_size_multiplier = m;
        self
    }

    pub fn base_table_size(mut self, size: u64) -> Self {
        self.base_table_size = size;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn compaction_startup_jitter(mut self, jitter: Duration) -> Self {
        self.compaction_startup_jitter = jitter;
        self
    }

    pub fn discard_stats(mut self, tx: mpsc::Sender<DiscardStats>) -> Self {
        self.discard_stats = Some(tx);
        self
    }

    /// Arena capacity for one memtable. Rotation is driven by WAL size,
    /// and skiplist nodes cost more than their WAL encoding (tower slots,
    /// alignment), so the arena carries generous slack: it must never
    /// grow while readers are active.
    pub(crate) fn arena_size(&self) -> u32 {
        let slack = self.mem_table_size * 2 + (1 << 20);
        (self.mem_table_size + slack).min(u32::MAX as u64 - 1) as u32
    }
}
