//! Configuration for emberkv
//!
//! Centralized configuration with sensible defaults. Every engine instance
//! receives its own `Config`; nothing here is process-global.

use std::path::PathBuf;

use crate::error::{EmberError, Result};

/// Default number of segments (must be a power of two)
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;
pub const DEFAULT_CACHE_SIZE: usize = 2048;
pub const DEFAULT_ASYNC_WRITE_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_FREE_SPACE_RECLAIM_CLASSES: usize = 5;
/// 1 MiB pages (shift of 20)
pub const DEFAULT_VOLUME_PAGE_SIZE: usize = 1 << 20;
pub const DEFAULT_FILE_RETRY_COUNT: u32 = 16;
pub const DEFAULT_FILE_LOCK_HEARTBEAT_MS: u64 = 1000;
pub const DEFAULT_METRICS_LOG_PERIOD_MS: u64 = 10_000;
pub const DEFAULT_CACHE_EXECUTOR_PERIOD_MS: u64 = 1000;
pub const DEFAULT_WAL_CHECKPOINT_BYTES: u64 = 8 * 1024 * 1024;

const MIN_VOLUME_PAGE_SIZE: usize = 512;

/// Where the engine keeps its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Heap-backed volume, nothing survives the process
    Memory,

    /// Directory holding the data file, the WAL and the lock file:
    ///   {dir}/
    ///     ├── data.ember   (paged volume)
    ///     ├── data.wal     (write-ahead log)
    ///     └── data.lock    (exclusive ownership marker)
    Directory(PathBuf),
}

impl Location {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Location::Directory(path.into())
    }
}

/// Main configuration for an emberkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Map Layer Configuration
    // -------------------------------------------------------------------------
    /// Number of independently locked segments, power of two
    pub concurrency_level: usize,

    /// Fair (FIFO hand-off) vs. unfair segment lock release
    pub lock_fairness: bool,

    // -------------------------------------------------------------------------
    // Engine Wrapper Configuration
    // -------------------------------------------------------------------------
    /// Instance cache policy
    pub cache_mode: CacheMode,

    /// Entry capacity of the bounded (LRU) cache
    pub cache_size: usize,

    /// Interval of the background sweep that signals moderate memory
    /// pressure to the cache (milliseconds, 0 disables)
    pub cache_executor_period_ms: u64,

    /// Route writes through the background write queue
    pub async_write: bool,

    /// Capacity of the async write queue
    pub async_write_queue_size: usize,

    /// What a writer does when the async queue is full
    pub queue_full_policy: QueueFullPolicy,

    /// Count operations and timings
    pub metrics: bool,

    /// Minimum interval between metrics log lines (milliseconds)
    pub metrics_log_period_ms: u64,

    // -------------------------------------------------------------------------
    // Store / Volume Configuration
    // -------------------------------------------------------------------------
    /// Number of size buckets in the free-space reclamation queue
    pub free_space_reclaim_classes: usize,

    /// Page granularity of the volume, power of two
    pub volume_page_size: usize,

    /// Zero-fill newly exposed and freed storage
    pub zero_unused_space: bool,

    /// Attempts for data file rename/delete
    pub file_retry_count: u32,

    /// Lock file polling interval (milliseconds)
    pub file_lock_heartbeat_ms: u64,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// When the WAL is forced to disk
    pub wal_sync_strategy: WalSyncStrategy,

    /// WAL size that triggers an automatic checkpoint after commit
    pub wal_checkpoint_bytes: u64,

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------
    pub diagnostics: Diagnostics,
}

/// Instance cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// No cache wrapper
    Disabled,

    /// Bounded least-recently-used cache of `cache_size` entries
    Lru,

    /// Unbounded; every entry reclaimed on any memory pressure signal
    Weak,

    /// Unbounded; entries reclaimed only on critical memory pressure
    Soft,

    /// Unbounded; entries leave only by invalidation
    HardRef,
}

/// Behavior of a writer facing a full async write queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Block the caller until the worker frees a slot
    Block,

    /// Fail immediately with `QueueSaturated`
    Fail,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync once per commit (commit marker included)
    OnCommit,

    /// fsync after every appended entry (slowest)
    EveryWrite,
}

/// Fine-grained diagnostic switches, all off by default
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Run full free-space/overlap verification after every commit.
    /// Only honored in builds with debug assertions.
    pub paranoid: bool,

    /// Trace WAL payloads instead of offsets only
    pub log_wal_content: bool,

    /// Trace every allocation and release in the store
    pub log_allocations: bool,

    /// Log a backtrace for every volume write covering this offset
    pub print_stack_at_offset: Option<u64>,

    /// Debug lines for store commit, rollback and index growth
    pub log_store: bool,

    /// Trace every record put, get, update and delete in the store
    pub log_store_records: bool,

    /// Trace cache and async write wrapper activity
    pub log_engine_wrappers: bool,

    /// Trace map operations and segment growth
    pub log_maps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            lock_fairness: false,
            cache_mode: CacheMode::Disabled,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_executor_period_ms: DEFAULT_CACHE_EXECUTOR_PERIOD_MS,
            async_write: false,
            async_write_queue_size: DEFAULT_ASYNC_WRITE_QUEUE_SIZE,
            queue_full_policy: QueueFullPolicy::Block,
            metrics: false,
            metrics_log_period_ms: DEFAULT_METRICS_LOG_PERIOD_MS,
            free_space_reclaim_classes: DEFAULT_FREE_SPACE_RECLAIM_CLASSES,
            volume_page_size: DEFAULT_VOLUME_PAGE_SIZE,
            zero_unused_space: true,
            file_retry_count: DEFAULT_FILE_RETRY_COUNT,
            file_lock_heartbeat_ms: DEFAULT_FILE_LOCK_HEARTBEAT_MS,
            wal_sync_strategy: WalSyncStrategy::OnCommit,
            wal_checkpoint_bytes: DEFAULT_WAL_CHECKPOINT_BYTES,
            diagnostics: Diagnostics::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if !self.concurrency_level.is_power_of_two() {
            return Err(EmberError::Config(format!(
                "concurrency level must be a power of two, got {}",
                self.concurrency_level
            )));
        }
        if !self.volume_page_size.is_power_of_two() || self.volume_page_size < MIN_VOLUME_PAGE_SIZE
        {
            return Err(EmberError::Config(format!(
                "volume page size must be a power of two >= {}, got {}",
                MIN_VOLUME_PAGE_SIZE, self.volume_page_size
            )));
        }
        if self.free_space_reclaim_classes == 0 || self.free_space_reclaim_classes > 16 {
            return Err(EmberError::Config(format!(
                "free space reclaim classes must be in 1..=16, got {}",
                self.free_space_reclaim_classes
            )));
        }
        if self.async_write && self.async_write_queue_size == 0 {
            return Err(EmberError::Config(
                "async write queue size must be positive".to_string(),
            ));
        }
        if self.cache_mode == CacheMode::Lru && self.cache_size == 0 {
            return Err(EmberError::Config("LRU cache size must be positive".to_string()));
        }
        Ok(())
    }

    /// log2 of the page size
    pub fn page_shift(&self) -> u32 {
        self.volume_page_size.trailing_zeros()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of segments (power of two)
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.config.concurrency_level = level;
        self
    }

    /// Release segment locks fairly
    pub fn lock_fairness(mut self, fair: bool) -> Self {
        self.config.lock_fairness = fair;
        self
    }

    /// Set the cache policy
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.config.cache_mode = mode;
        self
    }

    /// Set the bounded cache capacity (entries)
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Set the cache sweep interval (milliseconds, 0 disables)
    pub fn cache_executor_period_ms(mut self, ms: u64) -> Self {
        self.config.cache_executor_period_ms = ms;
        self
    }

    /// Enable the async write wrapper
    pub fn async_write(mut self, enabled: bool) -> Self {
        self.config.async_write = enabled;
        self
    }

    /// Set the async write queue capacity
    pub fn async_write_queue_size(mut self, size: usize) -> Self {
        self.config.async_write_queue_size = size;
        self
    }

    /// Set the queue-full behavior of the async write wrapper
    pub fn queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.config.queue_full_policy = policy;
        self
    }

    /// Enable the metrics wrapper
    pub fn metrics(mut self, enabled: bool) -> Self {
        self.config.metrics = enabled;
        self
    }

    /// Set the metrics log period (milliseconds)
    pub fn metrics_log_period_ms(mut self, ms: u64) -> Self {
        self.config.metrics_log_period_ms = ms;
        self
    }

    /// Set the number of free-space size classes
    pub fn free_space_reclaim_classes(mut self, classes: usize) -> Self {
        self.config.free_space_reclaim_classes = classes;
        self
    }

    /// Set the volume page size (bytes, power of two)
    pub fn volume_page_size(mut self, size: usize) -> Self {
        self.config.volume_page_size = size;
        self
    }

    /// Zero-fill unused storage
    pub fn zero_unused_space(mut self, enabled: bool) -> Self {
        self.config.zero_unused_space = enabled;
        self
    }

    /// Set the rename/delete retry count
    pub fn file_retry_count(mut self, count: u32) -> Self {
        self.config.file_retry_count = count;
        self
    }

    /// Set the lock file heartbeat (milliseconds)
    pub fn file_lock_heartbeat_ms(mut self, ms: u64) -> Self {
        self.config.file_lock_heartbeat_ms = ms;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the automatic checkpoint threshold (bytes of WAL)
    pub fn wal_checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.config.wal_checkpoint_bytes = bytes;
        self
    }

    /// Set the diagnostic switches
    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.config.diagnostics = diagnostics;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
