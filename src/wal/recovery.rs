//! WAL Recovery
//!
//! Handles crash recovery by replaying the WAL.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::{AtlasError, Result};
use super::{WalEntry, WalReader};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries found (recovery stops at the first one)
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the WAL was truncated (partial writes removed)
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Recover entries from a WAL file
    ///
    /// This will:
    /// 1. Read all valid entries
    /// 2. Stop at the first damaged entry; later entries cannot be trusted
    ///    because transactions must be replayed in order
    /// 3. Truncate the file after the last valid entry
    /// 4. Return all valid entries in order
    pub fn recover(path: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let (entries, result, valid_len) = Self::scan(path, true)?;
        if result.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                "Truncated WAL {} to {} bytes after {} valid entries",
                path.display(),
                valid_len,
                result.entries_recovered
            );
        }
        Ok((entries, result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (_, result, _) = Self::scan(path, false)?;
        Ok(result)
    }

    fn scan(path: &Path, keep_entries: bool) -> Result<(Vec<WalEntry>, RecoveryResult, u64)> {
        let mut result = RecoveryResult::default();
        let mut entries = Vec::new();
        if !path.exists() {
            return Ok((entries, result, 0));
        }

        let file_len = std::fs::metadata(path)?.len();
        let mut reader = WalReader::open(path)?;
        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    result.entries_recovered += 1;
                    result.last_lsn = entry.lsn;
                    if keep_entries {
                        entries.push(entry);
                    }
                }
                Ok(None) => break,
                Err(AtlasError::WalCorruption(reason)) => {
                    tracing::warn!("WAL corruption in {}: {}", path.display(), reason);
                    result.entries_corrupted += 1;
                    break;
                }
                Err(AtlasError::Serialization(reason)) => {
                    tracing::warn!("Undecodable WAL entry in {}: {}", path.display(), reason);
                    result.entries_corrupted += 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let valid_len = reader.offset();
        result.was_truncated = valid_len < file_len;
        Ok((entries, result, valid_len))
    }
}
