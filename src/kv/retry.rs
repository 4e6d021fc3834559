//! Backoff for transient KV errors
//!
//! Exponential backoff with random jitter, applied only to errors that
//! `AtlasError::is_retryable` accepts. Conflicts pass straight through.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::warn;

use crate::error::Result;
use super::{Driver, KeyStream, Transaction};

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total tries, first attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): half fixed, half random
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(self.max_delay);
        let half = exp / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, attempt, policy.max_attempts, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// =============================================================================
// Retrying Driver
// =============================================================================

/// Wraps any driver so transient failures on begin, reads, scans and commit
/// are retried
pub struct RetryingDriver<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: Driver> RetryingDriver<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: Driver> Driver for RetryingDriver<D> {
    async fn begin(&self, read_only: bool) -> Result<Box<dyn Transaction>> {
        let inner = with_backoff(&self.policy, "begin", || self.inner.begin(read_only)).await?;
        Ok(Box::new(RetryingTransaction { inner, policy: self.policy }))
    }
}

struct RetryingTransaction {
    inner: Box<dyn Transaction>,
    policy: RetryPolicy,
}

#[async_trait]
impl Transaction for RetryingTransaction {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    async fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        let policy = self.policy;
        let mut attempt = 1;
        loop {
            match self.inner.get(key).await {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    warn!("get {} failed (attempt {}): {}", key, attempt, e);
                    tokio::time::sleep(policy.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn get_for_update(&mut self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get_for_update(key).await
    }

    async fn set(&mut self, key: &str, value: Bytes) -> Result<()> {
        self.inner.set(key, value).await
    }

    async fn insert(&mut self, key: &str, value: Bytes) -> Result<()> {
        self.inner.insert(key, value).await
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn keys(&mut self, prefix: &str, count: Option<usize>) -> Result<KeyStream> {
        let policy = self.policy;
        let mut attempt = 1;
        loop {
            match self.inner.keys(prefix, count).await {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    warn!("keys {} failed (attempt {}): {}", prefix, attempt, e);
                    tokio::time::sleep(policy.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let policy = self.policy;
        let mut attempt = 1;
        loop {
            match self.inner.commit().await {
                // Only worth retrying if the store left the transaction open
                Err(e) if e.is_retryable() && self.inner.is_open() && attempt < policy.max_attempts => {
                    warn!("commit failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(policy.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn abort(&mut self) -> Result<()> {
        self.inner.abort().await
    }
}
