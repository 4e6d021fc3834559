//! KV Driver & Transaction Module
//!
//! The versioned key-value substrate every metadata record lives in.
//!
//! ## Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `begin(read_only)` | Open a transaction |
//! | `get` / `get_for_update` | Read a key (the latter joins the conflict set) |
//! | `set` / `delete` | Buffer a write |
//! | `insert` | Buffer a create; `Conflict` if the key already exists |
//! | `keys(prefix, count)` | Stream keys under a prefix in lexical order |
//! | `commit` / `abort` | Close the transaction |
//!
//! ## Conflict Model
//! ```text
//!   begin ──► reads / buffered writes ──► commit
//!                                           │
//!                  any written or read-for-update key committed by
//!                  someone else since begin?  ──yes──► Conflict
//!                                           │no
//!                                           ▼
//!                                   WAL append, apply
//! ```

mod local;
mod retry;

pub use local::LocalDriver;
pub use retry::{with_backoff, RetryPolicy, RetryingDriver};

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_stream::{Stream, StreamExt};

use crate::error::Result;

/// Stream of keys returned by a prefix scan
pub type KeyStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A KV store that hands out transactions
#[async_trait]
pub trait Driver: Send + Sync {
    async fn begin(&self, read_only: bool) -> Result<Box<dyn Transaction>>;
}

/// One KV transaction. Every method fails with `TransactionClosed` after
/// `commit` or `abort`.
#[async_trait]
pub trait Transaction: Send {
    fn is_open(&self) -> bool;

    fn is_read_only(&self) -> bool;

    async fn get(&mut self, key: &str) -> Result<Option<Bytes>>;

    /// Read a key and fail the commit if someone else writes it meanwhile
    async fn get_for_update(&mut self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&mut self, key: &str, value: Bytes) -> Result<()>;

    /// Create a key; `Conflict` if it already exists
    async fn insert(&mut self, key: &str, value: Bytes) -> Result<()>;

    async fn delete(&mut self, key: &str) -> Result<()>;

    async fn keys(&mut self, prefix: &str, count: Option<usize>) -> Result<KeyStream>;

    async fn commit(&mut self) -> Result<()>;

    async fn abort(&mut self) -> Result<()>;
}

// =============================================================================
// Record Helpers
// =============================================================================

/// Read and decode a bincode record
pub async fn get_record<T: DeserializeOwned>(
    txn: &mut dyn Transaction,
    key: &str,
) -> Result<Option<T>> {
    match txn.get(key).await? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a bincode record
pub async fn set_record<T: Serialize + ?Sized>(
    txn: &mut dyn Transaction,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    txn.set(key, Bytes::from(bytes)).await
}

/// Collect every key under `prefix`
pub async fn collect_keys(
    txn: &mut dyn Transaction,
    prefix: &str,
    count: Option<usize>,
) -> Result<Vec<String>> {
    let stream = txn.keys(prefix, count).await?;
    Ok(stream.collect().await)
}

/// Delete every key under `prefix`, returning how many were removed
pub async fn delete_prefix(txn: &mut dyn Transaction, prefix: &str) -> Result<usize> {
    let keys = collect_keys(txn, prefix, None).await?;
    for key in &keys {
        txn.delete(key).await?;
    }
    Ok(keys.len())
}

/// Abort if still open, logging instead of failing
pub async fn close(txn: &mut dyn Transaction) {
    if txn.is_open() {
        if let Err(e) = txn.abort().await {
            tracing::warn!("Failed to abort transaction: {}", e);
        }
    }
}
