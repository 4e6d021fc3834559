//! WAL Reader
//!
//! Sequentially reads entries from a WAL file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{AtlasError, Result};
use super::entry::{parse_header, WalEntry, HEADER_SIZE};

/// Reads entries from the WAL file in order
pub struct WalReader {
    reader: BufReader<File>,
    offset: u64,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Read the next entry
    ///
    /// Returns `Ok(None)` at a clean end of file and `WalCorruption` for a
    /// partial or damaged entry.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = read_fully(&mut self.reader, &mut header_buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < HEADER_SIZE {
            return Err(AtlasError::WalCorruption(format!(
                "partial header at offset {}",
                self.offset
            )));
        }

        let header = parse_header(&header_buf)?;
        let mut body = vec![0u8; header.len as usize];
        let read = read_fully(&mut self.reader, &mut body)?;
        if read < body.len() {
            return Err(AtlasError::WalCorruption(format!(
                "partial body for LSN {} at offset {}",
                header.lsn, self.offset
            )));
        }

        let entry = WalEntry::from_body(header, &body)?;
        self.offset += (HEADER_SIZE + body.len()) as u64;
        Ok(Some(entry))
    }

    /// Byte offset just past the last entry returned
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Like `read_exact`, but reports how much was read before EOF
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
