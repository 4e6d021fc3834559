//! Distributed Lock
//!
//! Lease-based mutual exclusion over a KV key. Used to serialize shard
//! creation per KB and KB-wide migrations, never ordinary message processing.
//!
//! ## Lifecycle
//! ```text
//!   acquire ──insert /distributed/locks/{name}──► held ──release──► deleted
//!      │  ▲                                         │
//!      │  └── expired record? take it over          └── refresh task rewrites
//!      ▼                                                expires_at every
//!   held elsewhere: poll with backoff until               refresh interval
//!   the wait budget runs out ──► ResourceLocked
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AtlasError, Result};
use crate::keys;
use crate::kv::{self, Driver};

/// Lock timings
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// How long a record stays valid without refresh
    pub lease: Duration,
    /// How often the holder extends the lease; shorter than `lease`
    pub refresh_interval: Duration,
    /// How long `acquire` waits for a lock held elsewhere
    pub acquire_timeout: Duration,
    /// First poll delay, doubled up to one second
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(3),
            acquire_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    expires_at_ms: u64,
}

impl LockRecord {
    fn is_expired(&self) -> bool {
        self.expires_at_ms <= now_ms()
    }
}

/// Acquire the lock `name`, waiting up to `config.acquire_timeout`
pub async fn distributed_lock(
    driver: Arc<dyn Driver>,
    name: &str,
    config: &LockConfig,
) -> Result<LockGuard> {
    let key = keys::lock(name);
    let holder = Uuid::new_v4().to_string();
    let deadline = Instant::now() + config.acquire_timeout;
    let max_poll = Duration::from_secs(1);
    let mut poll = config.poll_interval;

    loop {
        let held_elsewhere = match try_acquire(driver.as_ref(), &key, &holder, config.lease).await {
            Ok(true) => break,
            Ok(false) => true,
            // Lost a race with another acquirer: re-read straight away
            Err(e) if e.is_conflict() => false,
            Err(e) => return Err(e),
        };

        let now = Instant::now();
        if now >= deadline {
            debug!("Gave up waiting for lock {}", name);
            return Err(AtlasError::ResourceLocked(name.to_string()));
        }
        if held_elsewhere {
            tokio::time::sleep(poll.min(deadline - now)).await;
            poll = (poll * 2).min(max_poll);
        }
    }

    debug!("Acquired lock {} as {}", name, holder);
    let (stop_tx, stop_rx) = oneshot::channel();
    let refresh = tokio::spawn(refresh_loop(
        Arc::clone(&driver),
        key.clone(),
        holder.clone(),
        *config,
        stop_rx,
    ));

    Ok(LockGuard {
        name: name.to_string(),
        key,
        holder,
        driver,
        stop: Some(stop_tx),
        refresh: Some(refresh),
    })
}

/// Whether an unexpired lock record exists for `name`
pub async fn is_locked(driver: &dyn Driver, name: &str) -> Result<bool> {
    let mut txn = driver.begin(true).await?;
    let record: Result<Option<LockRecord>> = kv::get_record(txn.as_mut(), &keys::lock(name)).await;
    kv::close(txn.as_mut()).await;
    Ok(record?.map(|r| !r.is_expired()).unwrap_or(false))
}

async fn try_acquire(driver: &dyn Driver, key: &str, holder: &str, lease: Duration) -> Result<bool> {
    let mut txn = driver.begin(false).await?;
    let result: Result<bool> = async {
        let record = LockRecord {
            holder: holder.to_string(),
            expires_at_ms: now_ms() + lease.as_millis() as u64,
        };
        let bytes = bytes::Bytes::from(bincode::serialize(&record)?);

        match txn.get_for_update(key).await? {
            None => txn.insert(key, bytes).await?,
            Some(existing) => {
                let existing: LockRecord = bincode::deserialize(&existing)?;
                if !existing.is_expired() {
                    return Ok(false);
                }
                warn!("Taking over expired lock {} from {}", key, existing.holder);
                txn.set(key, bytes).await?;
            }
        }
        txn.commit().await?;
        Ok(true)
    }
    .await;
    kv::close(txn.as_mut()).await;
    result
}

async fn refresh_loop(
    driver: Arc<dyn Driver>,
    key: String,
    holder: String,
    config: LockConfig,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.refresh_interval);
    // The first tick completes immediately; the lease is fresh already
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                match extend_lease(driver.as_ref(), &key, &holder, config.lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Lock {} is no longer held by {}; stopping refresh", key, holder);
                        break;
                    }
                    Err(e) => warn!("Failed to refresh lock {}: {}", key, e),
                }
            }
        }
    }
}

async fn extend_lease(driver: &dyn Driver, key: &str, holder: &str, lease: Duration) -> Result<bool> {
    let mut txn = driver.begin(false).await?;
    let result: Result<bool> = async {
        let current: Option<LockRecord> = match txn.get_for_update(key).await? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        };
        match current {
            Some(record) if record.holder == holder => {
                let record = LockRecord {
                    holder: holder.to_string(),
                    expires_at_ms: now_ms() + lease.as_millis() as u64,
                };
                kv::set_record(txn.as_mut(), key, &record).await?;
                txn.commit().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
    .await;
    kv::close(txn.as_mut()).await;
    result
}

async fn delete_if_owned(driver: &dyn Driver, key: &str, holder: &str) -> Result<()> {
    let mut txn = driver.begin(false).await?;
    let result: Result<()> = async {
        let current: Option<LockRecord> = kv::get_record(txn.as_mut(), key).await?;
        if current.map(|r| r.holder == holder).unwrap_or(false) {
            txn.delete(key).await?;
            txn.commit().await?;
        }
        Ok(())
    }
    .await;
    kv::close(txn.as_mut()).await;
    result
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Guard
// =============================================================================

/// A held lock. Call `release` on scope exit; dropping without it stops the
/// refresh task and deletes the record in the background.
pub struct LockGuard {
    name: String,
    key: String,
    holder: String,
    driver: Arc<dyn Driver>,
    stop: Option<oneshot::Sender<()>>,
    refresh: Option<JoinHandle<()>>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop refreshing and delete the record
    pub async fn release(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.refresh.take() {
            let _ = handle.await;
        }
        debug!("Releasing lock {}", self.name);
        delete_if_owned(self.driver.as_ref(), &self.key, &self.holder).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.refresh.take() else {
            return;
        };
        handle.abort();

        let driver = Arc::clone(&self.driver);
        let key = self.key.clone();
        let holder = self.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = delete_if_owned(driver.as_ref(), &key, &holder).await {
                        warn!("Failed to release dropped lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("Lock {} dropped outside a runtime; it expires with its lease", self.name),
        }
    }
}
