//! KB migrations
//!
//! A migration is a versioned, KB-scoped rewrite of stored records. KBs
//! that still need one are marked under `migrations/{kbid}`; the global
//! progress lives in `migration/info`.
//!
//! ```text
//!   schedule_kb ──► migrations/{kbid}
//!                        │
//!   run_kb (lock migration-{kbid})
//!     for each migration newer than config.migration_version:
//!         own txn: migrate ──► bump migration_version ──► commit
//!     clear migrations/{kbid}
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::keys;
use crate::kv::{self, Driver, Transaction};
use crate::lock::{distributed_lock, LockConfig};
use crate::orm::KnowledgeBox;

pub fn migration_lock(kbid: &str) -> String {
    format!("migration-{}", kbid)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMigrationInfo {
    pub current_version: u64,
    pub target_version: Option<u64>,
}

/// One versioned KB migration
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> u64;

    /// Rewrite the records of `kbid` inside `txn`; the caller commits
    async fn migrate_kb(&self, txn: &mut dyn Transaction, kbid: &str) -> Result<()>;
}

pub struct Migrator {
    driver: Arc<dyn Driver>,
    lock_config: LockConfig,
}

impl Migrator {
    pub fn new(driver: Arc<dyn Driver>, config: &Config) -> Self {
        Self { driver, lock_config: config.lock_config() }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    pub async fn get_info(&self) -> Result<GlobalMigrationInfo> {
        let mut txn = self.driver.begin(true).await?;
        let result = kv::get_record(txn.as_mut(), keys::MIGRATION_INFO).await;
        kv::close(txn.as_mut()).await;
        Ok(result?.unwrap_or_default())
    }

    pub async fn set_info(&self, info: GlobalMigrationInfo) -> Result<()> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<()> = async {
            kv::set_record(txn.as_mut(), keys::MIGRATION_INFO, &info).await?;
            txn.commit().await
        }
        .await;
        kv::close(txn.as_mut()).await;
        result
    }

    /// Mark `kbid` as needing migration
    pub async fn schedule_kb(&self, kbid: &str) -> Result<()> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<()> = async {
            txn.set(&keys::kb_migration(kbid), Bytes::new()).await?;
            txn.commit().await
        }
        .await;
        kv::close(txn.as_mut()).await;
        result
    }

    pub async fn pending_kbs(&self) -> Result<Vec<String>> {
        let mut txn = self.driver.begin(true).await?;
        let result = kv::collect_keys(txn.as_mut(), keys::MIGRATIONS_PREFIX, None).await;
        kv::close(txn.as_mut()).await;
        Ok(result?
            .into_iter()
            .filter_map(|key| key.strip_prefix(keys::MIGRATIONS_PREFIX).map(str::to_string))
            .collect())
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Apply every migration newer than the KB's version, under the KB's
    /// migration lock. Returns the KB's version afterwards.
    pub async fn run_kb(&self, kbid: &str, migrations: &[Arc<dyn Migration>]) -> Result<u64> {
        let guard = distributed_lock(Arc::clone(&self.driver), &migration_lock(kbid), &self.lock_config).await?;
        let result = self.run_kb_locked(kbid, migrations).await;
        if let Err(e) = guard.release().await {
            warn!(kbid, "Failed to release migration lock: {}", e);
        }
        result
    }

    async fn run_kb_locked(&self, kbid: &str, migrations: &[Arc<dyn Migration>]) -> Result<u64> {
        let mut ordered: Vec<&Arc<dyn Migration>> = migrations.iter().collect();
        ordered.sort_by_key(|m| m.version());

        let mut version = None;
        for migration in ordered {
            let mut txn = self.driver.begin(false).await?;
            let result: Result<Option<u64>> = async {
                let Some(mut config) = KnowledgeBox::get_config(txn.as_mut(), kbid).await? else {
                    return Ok(None);
                };
                if migration.version() <= config.migration_version {
                    return Ok(Some(config.migration_version));
                }
                migration.migrate_kb(txn.as_mut(), kbid).await?;
                config.migration_version = migration.version();
                kv::set_record(txn.as_mut(), &keys::kb_config(kbid), &config).await?;
                txn.commit().await?;
                info!(kbid, version = config.migration_version, "Migrated knowledge box");
                Ok(Some(config.migration_version))
            }
            .await;
            kv::close(txn.as_mut()).await;

            match result? {
                Some(v) => version = Some(v),
                None => {
                    warn!(kbid, "Knowledge box vanished during migration");
                    break;
                }
            }
        }

        let version = match version {
            Some(v) => v,
            None => self.current_kb_version(kbid).await?,
        };
        self.clear_mark(kbid).await?;
        Ok(version)
    }

    /// Migrate every pending KB, then record the highest migration version
    /// as the current one. Returns how many KBs were migrated.
    pub async fn run_pending(&self, migrations: &[Arc<dyn Migration>]) -> Result<usize> {
        let pending = self.pending_kbs().await?;
        for kbid in &pending {
            match self.run_kb(kbid, migrations).await {
                Ok(_) | Err(AtlasError::KnowledgeBoxNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let mut info = self.get_info().await?;
        if let Some(latest) = migrations.iter().map(|m| m.version()).max() {
            info.current_version = info.current_version.max(latest);
        }
        if info.target_version.map(|t| t <= info.current_version).unwrap_or(false) {
            info.target_version = None;
        }
        self.set_info(info).await?;
        debug!(migrated = pending.len(), version = info.current_version, "Ran pending migrations");
        Ok(pending.len())
    }

    async fn current_kb_version(&self, kbid: &str) -> Result<u64> {
        let mut txn = self.driver.begin(true).await?;
        let result = KnowledgeBox::get_config(txn.as_mut(), kbid).await;
        kv::close(txn.as_mut()).await;
        match result? {
            Some(config) => Ok(config.migration_version),
            None => {
                // Deleted KBs are unmarked anyway
                self.clear_mark(kbid).await?;
                Err(AtlasError::KnowledgeBoxNotFound(kbid.to_string()))
            }
        }
    }

    async fn clear_mark(&self, kbid: &str) -> Result<()> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<()> = async {
            txn.delete(&keys::kb_migration(kbid)).await?;
            txn.commit().await
        }
        .await;
        kv::close(txn.as_mut()).await;
        result
    }
}
