use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the value log.
#[derive(Debug, Clone)]
pub struct VlogConfig {
    /// Directory holding the `.vlog` files
    pub dir: PathBuf,

    /// Rotation threshold for a single log file (default: 1GB)
    pub value_log_file_size: u32,

    /// Rotation threshold on entries written to a single file (default: 1M)
    pub value_log_max_entries: u32,

    /// Values shorter than this stay inline in the LSM tree (default: 1KB)
    pub value_threshold: usize,

    /// Fsync the head file after every write batch (default: false)
    pub sync_writes: bool,

    /// Verify the record checksum on every read (default: false)
    pub verify_value_checksum: bool,

    /// Open existing files without truncating or writing (default: false)
    pub read_only: bool,

    /// Skip all disk operations; every value stays in the LSM (default: false)
    pub in_memory: bool,

    /// Entry-count ceiling for a single rewrite batch (default: 10_000)
    pub max_batch_count: u64,

    /// Byte ceiling for a single rewrite batch (default: 10MB)
    pub max_batch_size: u64,

    /// Garbage collection configuration
    pub gc: GcConfig,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often the background task attempts a collection run (default: 5m)
    pub gc_interval: Duration,

    /// How often the background task syncs the head file (default: 1s)
    pub sync_interval: Duration,

    /// Minimum dead-to-total ratio before a file is rewritten (default: 0.5)
    pub discard_ratio: f64,

    /// Fraction of a file inspected per sampling pass (default: 0.1)
    pub sample_size_ratio: f64,

    /// Fraction of `value_log_max_entries` inspected per pass (default: 0.01)
    pub sample_count_ratio: f64,
}

impl Default for VlogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberlog"),
            value_log_file_size: 1 << 30, // 1GB
            value_log_max_entries: 1_000_000,
            value_threshold: 1024,
            sync_writes: false,
            verify_value_checksum: false,
            read_only: false,
            in_memory: false,
            max_batch_count: 10_000,
            max_batch_size: 10 << 20, // 10MB
            gc: GcConfig::default(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(300),
            sync_interval: Duration::from_secs(1),
            discard_ratio: 0.5,
            sample_size_ratio: 0.1,
            sample_count_ratio: 0.01,
        }
    }
}

impl VlogConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the single-file rotation size
    pub fn value_log_file_size(mut self, size: u32) -> Self {
        self.value_log_file_size = size;
        self
    }

    /// Set the per-file entry-count rotation threshold
    pub fn value_log_max_entries(mut self, entries: u32) -> Self {
        self.value_log_max_entries = entries;
        self
    }

    /// Set the inline-value threshold
    pub fn value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    /// Fsync after every write batch
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Verify checksums on read
    pub fn verify_value_checksum(mut self, enabled: bool) -> Self {
        self.verify_value_checksum = enabled;
        self
    }

    /// Open the value log read-only
    pub fn read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }

    /// Skip all disk operations
    pub fn in_memory(mut self, enabled: bool) -> Self {
        self.in_memory = enabled;
        self
    }

    /// Set the rewrite batch entry-count ceiling
    pub fn max_batch_count(mut self, count: u64) -> Self {
        self.max_batch_count = count;
        self
    }

    /// Set the rewrite batch byte ceiling
    pub fn max_batch_size(mut self, size: u64) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Configure garbage collection
    pub fn gc(mut self, config: GcConfig) -> Self {
        self.gc = config;
        self
    }
}

impl GcConfig {
    /// Set the collection attempt interval
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the head-file sync interval
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the rewrite discard ratio
    pub fn discard_ratio(mut self, ratio: f64) -> Self {
        self.discard_ratio = ratio;
        self
    }

    /// Set the sampling window as a fraction of file size
    pub fn sample_size_ratio(mut self, ratio: f64) -> Self {
        self.sample_size_ratio = ratio;
        self
    }

    /// Set the sampling window as a fraction of the entry-count ceiling
    pub fn sample_count_ratio(mut self, ratio: f64) -> Self {
        self.sample_count_ratio = ratio;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VlogConfig::default();
        assert_eq!(config.dir, PathBuf::from("./emberlog"));
        assert_eq!(config.value_log_file_size, 1 << 30);
        assert_eq!(config.value_log_max_entries, 1_000_000);
        assert_eq!(config.value_threshold, 1024);
        assert!(!config.sync_writes);
        assert!(!config.verify_value_checksum);
    }

    #[test]
    fn test_config_builder() {
        let config = VlogConfig::new("/tmp/test")
            .value_log_file_size(64 * 1024)
            .value_threshold(32)
            .sync_writes(true)
            .gc(GcConfig::default()
                .gc_interval(Duration::from_secs(30))
                .discard_ratio(0.7));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.value_log_file_size, 64 * 1024);
        assert_eq!(config.value_threshold, 32);
        assert!(config.sync_writes);
        assert_eq!(config.gc.gc_interval, Duration::from_secs(30));
        assert_eq!(config.gc.discard_ratio, 0.7);
    }
}
