//! Deadletter storage
//!
//! Messages of a failed batch are kept off-path, keyed by
//! `(partition, seqid, index in batch)`, for inspection and replay.
//!
//! On-disk layout of `FileDeadletterStore`:
//! ```text
//! {dir}/{partition}/{seqid}-{index}.bin     bincode BrokerMessage
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::model::BrokerMessage;

#[async_trait]
pub trait DeadletterStore: Send + Sync {
    async fn deadletter(&self, partition: &str, seqid: i64, index: usize, message: &BrokerMessage) -> Result<()>;
}

// =============================================================================
// Files
// =============================================================================

pub struct FileDeadletterStore {
    dir: PathBuf,
}

impl FileDeadletterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, partition: &str, seqid: i64, index: usize) -> PathBuf {
        self.dir.join(partition).join(format!("{}-{}.bin", seqid, index))
    }

    /// Deadlettered files of a partition, in name order
    pub async fn list(&self, partition: &str) -> Result<Vec<PathBuf>> {
        let dir = self.dir.join(partition);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "bin").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn read(path: &Path) -> Result<BrokerMessage> {
        let bytes = tokio::fs::read(path).await?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait]
impl DeadletterStore for FileDeadletterStore {
    async fn deadletter(&self, partition: &str, seqid: i64, index: usize, message: &BrokerMessage) -> Result<()> {
        let path = self.path(partition, seqid, index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bincode::serialize(message)?).await?;
        debug!(path = %path.display(), "Deadlettered message");
        Ok(())
    }
}

// =============================================================================
// Memory
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DeadletterEntry {
    pub partition: String,
    pub seqid: i64,
    pub index: usize,
    pub message: BrokerMessage,
}

#[derive(Debug, Default)]
pub struct MemoryDeadletterStore {
    entries: Mutex<Vec<DeadletterEntry>>,
}

impl MemoryDeadletterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadletterEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl DeadletterStore for MemoryDeadletterStore {
    async fn deadletter(&self, partition: &str, seqid: i64, index: usize, message: &BrokerMessage) -> Result<()> {
        self.entries.lock().push(DeadletterEntry {
            partition: partition.to_string(),
            seqid,
            index,
            message: message.clone(),
        });
        Ok(())
    }
}
