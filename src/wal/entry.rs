//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their framing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// A single entry in the WAL: one committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Operations committed together
    pub operations: Vec<Operation>,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair
    Put { key: String, value: Vec<u8> },

    /// Delete a key
    Delete { key: String },
}

/// Body stored in the `Data` section; the LSN lives in the header
#[derive(Serialize, Deserialize)]
struct EntryBody {
    operations: Vec<Operation>,
    timestamp: u64,
}

impl WalEntry {
    pub fn new(lsn: u64, operations: Vec<Operation>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { lsn, operations, timestamp }
    }

    /// Frame the entry: header followed by the bincode body
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(&EntryBody {
            operations: self.operations.clone(),
            timestamp: self.timestamp,
        })?;
        let len = u32::try_from(body.len())
            .map_err(|_| AtlasError::Serialization("WAL entry larger than 4GiB".into()))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&self.lsn.to_be_bytes());
        buf.extend_from_slice(&compute_crc(&body).to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parse one framed entry from the start of `bytes`
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let header = parse_header(bytes)?;
        let end = HEADER_SIZE + header.len as usize;
        if bytes.len() < end {
            return Err(AtlasError::WalCorruption(format!(
                "entry {} truncated: need {} bytes, have {}",
                header.lsn,
                end,
                bytes.len()
            )));
        }
        Self::from_body(header, &bytes[HEADER_SIZE..end])
    }

    pub(crate) fn from_body(header: EntryHeader, body: &[u8]) -> Result<Self> {
        let actual = compute_crc(body);
        if actual != header.crc {
            return Err(AtlasError::WalCorruption(format!(
                "CRC mismatch for LSN {}: expected {:08x}, got {:08x}",
                header.lsn, header.crc, actual
            )));
        }
        let body: EntryBody = bincode::deserialize(body)?;
        Ok(Self {
            lsn: header.lsn,
            operations: body.operations,
            timestamp: body.timestamp,
        })
    }

    /// Size of this entry on disk
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(self.serialize()?.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: u32,
}

pub(crate) fn parse_header(bytes: &[u8]) -> Result<EntryHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(AtlasError::WalCorruption(format!(
            "header truncated: {} of {} bytes",
            bytes.len(),
            HEADER_SIZE
        )));
    }
    let mut lsn = [0u8; 8];
    let mut crc = [0u8; 4];
    let mut len = [0u8; 4];
    lsn.copy_from_slice(&bytes[0..8]);
    crc.copy_from_slice(&bytes[8..12]);
    len.copy_from_slice(&bytes[12..16]);
    Ok(EntryHeader {
        lsn: u64::from_be_bytes(lsn),
        crc: u32::from_be_bytes(crc),
        len: u32::from_be_bytes(len),
    })
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
