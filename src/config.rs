use std::path::PathBuf;
use std::time::Duration;

/// How buffered writes reach their partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Apply on the client thread, no shard queues.
    Sync,
    /// Lock-guarded per-shard queue. Records are durably logged and
    /// tracked in a pending index before the worker applies them.
    Buffered,
    /// Bounded ring with atomic cursors; the worker re-reads record
    /// bytes from the shard log at apply time.
    Ring,
}

/// Configuration for the multi-partition write buffer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for shard logs (Buffered and Ring modes)
    pub dir: PathBuf,

    /// Freeze threshold per partition in bytes (default: 64MB)
    pub partition_capacity_bytes: usize,

    /// Freeze threshold per partition in entries (default: 1M)
    pub partition_capacity_entries: usize,

    /// Fraction of capacity at which stricter admission kicks in (default: 0.85)
    pub near_full_ratio: f64,

    /// Number of chains in each partition's hash table (default: 4096)
    pub hash_bucket_count: usize,

    /// Background writer threads, one per key-hash shard (default: 2)
    pub shard_count: usize,

    /// Per-shard work queue capacity (default: 1024)
    pub queue_capacity: usize,

    /// Max queued frozen partitions before writers stall (default: 8)
    pub level0_capacity: usize,

    /// Memory budget expressed as live mutable partitions (default: 64)
    pub max_partitions: usize,

    /// Arena block size in bytes (default: 1MB)
    pub arena_block_size: usize,

    /// Keys sampled from the fullest partition when picking a split
    /// boundary (default: 64)
    pub split_sample_size: usize,

    /// Base stall interval under level-0 backpressure; doubles with
    /// overflow depth (default: 1ms)
    pub backoff_base: Duration,

    /// Cap on a single stall interval (default: 100ms)
    pub backoff_max: Duration,

    /// Treat replay corruption as fatal instead of skipping (default: false)
    pub paranoid_checks: bool,

    /// Write strategy (default: Sync)
    pub write_mode: WriteMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            partition_capacity_bytes: 64 * 1024 * 1024, // 64MB
            partition_capacity_entries: 1 << 20,
            near_full_ratio: 0.85,
            hash_bucket_count: 4096,
            shard_count: 2,
            queue_capacity: 1024,
            level0_capacity: 8,
            max_partitions: 64,
            arena_block_size: 1024 * 1024, // 1MB
            split_sample_size: 64,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(100),
            paranoid_checks: false,
            write_mode: WriteMode::Sync,
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set partition freeze threshold in bytes
    pub fn partition_capacity_bytes(mut self, bytes: usize) -> Self {
        self.partition_capacity_bytes = bytes;
        self
    }

    /// Set partition freeze threshold in entries
    pub fn partition_capacity_entries(mut self, entries: usize) -> Self {
        self.partition_capacity_entries = entries;
        self
    }

    /// Set the near-full admission ratio
    pub fn near_full_ratio(mut self, ratio: f64) -> Self {
        self.near_full_ratio = ratio;
        self
    }

    /// Set hash chain count per partition
    pub fn hash_bucket_count(mut self, buckets: usize) -> Self {
        self.hash_bucket_count = buckets;
        self
    }

    /// Set background writer shard count
    pub fn shard_count(mut self, shards: usize) -> Self {
        self.shard_count = shards;
        self
    }

    /// Set per-shard queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set level-0 admission queue capacity
    pub fn level0_capacity(mut self, capacity: usize) -> Self {
        self.level0_capacity = capacity;
        self
    }

    /// Set the mutable partition budget
    pub fn max_partitions(mut self, max: usize) -> Self {
        self.max_partitions = max;
        self
    }

    /// Set arena block size
    pub fn arena_block_size(mut self, bytes: usize) -> Self {
        self.arena_block_size = bytes;
        self
    }

    /// Set split boundary sample size
    pub fn split_sample_size(mut self, n: usize) -> Self {
        self.split_sample_size = n;
        self
    }

    /// Set the backpressure stall policy
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Enable strict replay mode
    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    /// Set the write strategy
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dir, PathBuf::from("./cinderdb"));
        assert_eq!(config.partition_capacity_bytes, 64 * 1024 * 1024);
        assert_eq!(config.partition_capacity_entries, 1 << 20);
        assert_eq!(config.shard_count, 2);
        assert_eq!(config.level0_capacity, 8);
        assert_eq!(config.write_mode, WriteMode::Sync);
        assert!(!config.paranoid_checks);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/test")
            .partition_capacity_bytes(64 * 1024)
            .partition_capacity_entries(10_000)
            .near_full_ratio(0.9)
            .hash_bucket_count(128)
            .shard_count(4)
            .queue_capacity(256)
            .level0_capacity(2)
            .max_partitions(8)
            .split_sample_size(16)
            .backoff(Duration::from_micros(500), Duration::from_millis(50))
            .paranoid_checks(true)
            .write_mode(WriteMode::Ring);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.partition_capacity_bytes, 64 * 1024);
        assert_eq!(config.partition_capacity_entries, 10_000);
        assert_eq!(config.near_full_ratio, 0.9);
        assert_eq!(config.hash_bucket_count, 128);
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.level0_capacity, 2);
        assert_eq!(config.max_partitions, 8);
        assert_eq!(config.split_sample_size, 16);
        assert_eq!(config.backoff_base, Duration::from_micros(500));
        assert_eq!(config.backoff_max, Duration::from_millis(50));
        assert!(config.paranoid_checks);
        assert_eq!(config.write_mode, WriteMode::Ring);
    }
}
