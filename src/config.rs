use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a partition host.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Base directory for partition data
    pub base_dir: PathBuf,

    /// Records buffered in the head arena before a commit is urgent
    /// (default: 128K records)
    pub max_arena_records: usize,

    /// Hard segment-count bound; inserts are rejected beyond it (default: 32)
    pub max_lsm_segments: usize,

    /// Summed segment bytes that make a serving partition propose a split
    /// (default: 512MB)
    pub partition_split_threshold_bytes: u64,

    /// Entry capacity of the shared skip-index cache (default: 1024)
    pub index_cache_capacity: usize,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for pending arena commits (default: 1s)
    pub commit_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,

    /// How often the file tracker retries pending deletions (default: 30s)
    pub tracker_sweep_interval: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./emberdb"),
            max_arena_records: 128 * 1024,
            max_lsm_segments: 32,
            partition_split_threshold_bytes: 512 * 1024 * 1024,
            index_cache_capacity: 1024,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
            tracker_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl PartitionConfig {
    /// Create a new config with the given base directory
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Set the urgent-commit arena record count
    pub fn max_arena_records(mut self, count: usize) -> Self {
        self.max_arena_records = count;
        self
    }

    /// Set the hard segment-count bound
    pub fn max_lsm_segments(mut self, count: usize) -> Self {
        self.max_lsm_segments = count;
        self
    }

    /// Set the partition split threshold in bytes
    pub fn partition_split_threshold_bytes(mut self, bytes: u64) -> Self {
        self.partition_split_threshold_bytes = bytes;
        self
    }

    /// Set the skip-index cache capacity
    pub fn index_cache_capacity(mut self, entries: usize) -> Self {
        self.index_cache_capacity = entries;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set the commit check interval
    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Set the compaction check interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set the file tracker sweep interval
    pub fn tracker_sweep_interval(mut self, interval: Duration) -> Self {
        self.tracker_sweep_interval = interval;
        self
    }
}
