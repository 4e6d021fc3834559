//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::Result;
use super::{Operation, WalEntry, WalRecovery};

/// Writes entries to the WAL file
pub struct WalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_lsn: u64,
    sync_strategy: WalSyncStrategy,
    unsynced: usize,
}

impl WalWriter {
    /// Open or create a WAL file, continuing after its last valid entry
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let next_lsn = if path.exists() {
            let (_, result) = WalRecovery::recover(path)?;
            result.last_lsn + 1
        } else {
            1
        };
        Self::open_at(path, sync_strategy, next_lsn)
    }

    /// Open for append with a known next LSN (the caller already recovered)
    pub fn open_at(path: &Path, sync_strategy: WalSyncStrategy, next_lsn: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_lsn: next_lsn.max(1),
            sync_strategy,
            unsynced: 0,
        })
    }

    /// Append a committed batch, returning its LSN
    pub fn append(&mut self, operations: Vec<Operation>) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = WalEntry::new(lsn, operations).serialize()?;
        self.writer.write_all(&bytes)?;
        self.next_lsn += 1;
        self.unsynced += 1;

        match self.sync_strategy {
            WalSyncStrategy::EveryWrite => self.sync()?,
            WalSyncStrategy::EveryNEntries { count } => {
                if self.unsynced >= count.max(1) {
                    self.sync()?;
                } else {
                    self.writer.flush()?;
                }
            }
        }
        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Drop every entry; LSNs keep increasing after a reset
    pub fn reset(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.unsynced = 0;
        Ok(())
    }

    /// LSN the next append will receive
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::warn!("Failed to sync WAL on close: {}", e);
        }
    }
}
