//! Configuration for AtlasKB
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AtlasError, Result};

/// Main configuration for an AtlasKB ingest instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── kv.wal           (write-ahead log of committed transactions)
    ///     ├── kv.snapshot      (last checkpoint)
    ///     └── deadletter/      (failed broker messages)
    pub data_dir: PathBuf,

    /// Sync strategy: how often to fsync the KV WAL
    pub wal_sync_strategy: WalSyncStrategy,

    // -------------------------------------------------------------------------
    // KV Retry Configuration
    // -------------------------------------------------------------------------
    /// Total tries (first attempt included) for transient KV errors
    pub kv_retry_attempts: u32,

    /// First backoff delay (milliseconds), doubled on each retry
    pub kv_retry_base_delay_ms: u64,

    /// Upper bound of a single backoff delay (milliseconds)
    pub kv_retry_max_delay_ms: u64,

    // -------------------------------------------------------------------------
    // Distributed Lock Configuration
    // -------------------------------------------------------------------------
    /// Lease length of a lock record (milliseconds)
    pub lock_lease_ms: u64,

    /// Refresh interval of a held lock; must be shorter than the lease
    pub lock_refresh_ms: u64,

    /// How long acquisition waits before giving up (milliseconds)
    pub lock_acquire_timeout_ms: u64,

    /// First poll delay while the lock is held elsewhere (milliseconds)
    pub lock_poll_ms: u64,

    // -------------------------------------------------------------------------
    // Shard Configuration
    // -------------------------------------------------------------------------
    /// Field count above which a KB's active shard stops receiving new resources
    pub max_node_fields: u64,

    /// Replicas created for every logical shard
    pub shard_replicas: usize,

    /// Depth of the local index worker queue (1-4)
    pub index_queue_depth: usize,

    // -------------------------------------------------------------------------
    // Indexing Limits
    // -------------------------------------------------------------------------
    /// Resources with more paragraphs than this are refused by the indexer
    pub max_resource_paragraphs: usize,

    /// Entity facet labels (`/e/...`) kept per field text
    pub max_entity_facets: usize,

    // -------------------------------------------------------------------------
    // Processor Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the per-KB configuration cache
    pub kb_cache_capacity: usize,

    /// Open MULTI buffers older than this are dropped by `sweep_multi`
    pub multi_max_age_ms: Option<u64>,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every commit (safest, slowest)
    EveryWrite,

    /// fsync after N commits (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlaskb_data"),
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            kv_retry_attempts: 3,
            kv_retry_base_delay_ms: 50,
            kv_retry_max_delay_ms: 1000,
            lock_lease_ms: 10_000,
            lock_refresh_ms: 3_000,
            lock_acquire_timeout_ms: 30_000,
            lock_poll_ms: 100,
            max_node_fields: 200_000,
            shard_replicas: 1,
            index_queue_depth: 2,
            max_resource_paragraphs: 50_000,
            max_entity_facets: 50,
            kb_cache_capacity: 128,
            multi_max_age_ms: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject combinations that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        if self.lock_refresh_ms >= self.lock_lease_ms {
            return Err(AtlasError::Config(format!(
                "lock refresh interval ({}ms) must be shorter than the lease ({}ms)",
                self.lock_refresh_ms, self.lock_lease_ms
            )));
        }
        if self.kv_retry_attempts == 0 {
            return Err(AtlasError::Config("kv_retry_attempts must be at least 1".into()));
        }
        if self.kb_cache_capacity == 0 {
            return Err(AtlasError::Config("kb_cache_capacity must be at least 1".into()));
        }
        if !(1..=4).contains(&self.index_queue_depth) {
            return Err(AtlasError::Config(format!(
                "index_queue_depth must be between 1 and 4, got {}",
                self.index_queue_depth
            )));
        }
        if self.shard_replicas == 0 {
            return Err(AtlasError::Config("shard_replicas must be at least 1".into()));
        }
        Ok(())
    }

    pub fn lock_config(&self) -> crate::lock::LockConfig {
        crate::lock::LockConfig {
            lease: Duration::from_millis(self.lock_lease_ms),
            refresh_interval: Duration::from_millis(self.lock_refresh_ms),
            acquire_timeout: Duration::from_millis(self.lock_acquire_timeout_ms),
            poll_interval: Duration::from_millis(self.lock_poll_ms),
        }
    }

    pub fn retry_policy(&self) -> crate::kv::RetryPolicy {
        crate::kv::RetryPolicy {
            max_attempts: self.kv_retry_attempts,
            base_delay: Duration::from_millis(self.kv_retry_base_delay_ms),
            max_delay: Duration::from_millis(self.kv_retry_max_delay_ms),
        }
    }

    pub fn deadletter_dir(&self) -> PathBuf {
        self.data_dir.join("deadletter")
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the number of tries for transient KV errors
    pub fn kv_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.kv_retry_attempts = attempts;
        self
    }

    /// Set the backoff delays (in milliseconds)
    pub fn kv_retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.kv_retry_base_delay_ms = base;
        self.config.kv_retry_max_delay_ms = max;
        self
    }

    /// Set the lock lease and refresh interval (in milliseconds)
    pub fn lock_lease_ms(mut self, lease: u64, refresh: u64) -> Self {
        self.config.lock_lease_ms = lease;
        self.config.lock_refresh_ms = refresh;
        self
    }

    /// Set how long lock acquisition may wait (in milliseconds)
    pub fn lock_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_acquire_timeout_ms = ms;
        self
    }

    /// Set the initial lock poll delay (in milliseconds)
    pub fn lock_poll_ms(mut self, ms: u64) -> Self {
        self.config.lock_poll_ms = ms;
        self
    }

    /// Set the shard field ceiling
    pub fn max_node_fields(mut self, count: u64) -> Self {
        self.config.max_node_fields = count;
        self
    }

    /// Set the replicas per logical shard
    pub fn shard_replicas(mut self, count: usize) -> Self {
        self.config.shard_replicas = count;
        self
    }

    /// Set the local index worker queue depth, clamped to 1-4
    pub fn index_queue_depth(mut self, depth: usize) -> Self {
        self.config.index_queue_depth = depth.clamp(1, 4);
        self
    }

    /// Set the paragraph limit per resource
    pub fn max_resource_paragraphs(mut self, count: usize) -> Self {
        self.config.max_resource_paragraphs = count;
        self
    }

    /// Set the entity facet limit per field text
    pub fn max_entity_facets(mut self, count: usize) -> Self {
        self.config.max_entity_facets = count;
        self
    }

    /// Set the KB configuration cache capacity
    pub fn kb_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.kb_cache_capacity = capacity;
        self
    }

    /// Set the maximum age of an open MULTI buffer (in milliseconds)
    pub fn multi_max_age_ms(mut self, ms: u64) -> Self {
        self.config.multi_max_age_ms = Some(ms);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
