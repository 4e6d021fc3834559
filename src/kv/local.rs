//! Local KV driver
//!
//! In-process versioned store with optimistic transactions. Optionally
//! durable: commits go through the WAL and `checkpoint` compacts it into a
//! snapshot.
//!
//! # Concurrency:
//! - Readers take the state `RwLock` briefly; no lock is held across awaits
//! - Commit validates and applies under the write lock, so commits are
//!   serialized and a validated batch is never interleaved with another
//! - Reads observe the latest committed value (read-committed), conflicts
//!   are only checked for written and read-for-update keys

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::wal::{Operation, WalRecovery, WalWriter};
use super::{Driver, KeyStream, Transaction};

const WAL_FILE: &str = "kv.wal";
const SNAPSHOT_FILE: &str = "kv.snapshot";

/// One committed key. Deleted keys keep a tombstone so later commits can
/// still detect that they changed.
#[derive(Debug, Clone)]
struct Versioned {
    value: Option<Bytes>,
    version: u64,
}

#[derive(Default)]
struct State {
    data: BTreeMap<String, Versioned>,
    version: u64,
    last_lsn: u64,
}

struct Store {
    state: RwLock<State>,
    wal: Mutex<Option<WalWriter>>,
    snapshot_path: Option<PathBuf>,
}

/// Snapshot body; framed as CRC (4) + Len (8) + bincode
#[derive(Serialize, Deserialize)]
struct Snapshot {
    last_lsn: u64,
    version: u64,
    entries: Vec<(String, Vec<u8>)>,
}

/// In-process KV driver
#[derive(Clone)]
pub struct LocalDriver {
    store: Arc<Store>,
}

impl LocalDriver {
    /// Volatile store; nothing touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(Store {
                state: RwLock::new(State::default()),
                wal: Mutex::new(None),
                snapshot_path: None,
            }),
        }
    }

    /// Open (or create) a durable store under `config.data_dir`
    ///
    /// Recovery order:
    /// 1. Load the snapshot, if any
    /// 2. Replay WAL entries newer than the snapshot
    /// 3. Reopen the WAL for append
    pub fn open(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let wal_path = config.data_dir.join(WAL_FILE);
        let snapshot_path = config.data_dir.join(SNAPSHOT_FILE);

        // Step 1: snapshot
        let mut state = State::default();
        if snapshot_path.exists() {
            let snapshot = read_snapshot(&snapshot_path)?;
            state.version = snapshot.version;
            state.last_lsn = snapshot.last_lsn;
            for (key, value) in snapshot.entries {
                state.data.insert(
                    key,
                    Versioned { value: Some(Bytes::from(value)), version: snapshot.version },
                );
            }
        }

        // Step 2: WAL replay
        let (entries, recovery) = WalRecovery::recover(&wal_path)?;
        let mut replayed = 0u64;
        for entry in entries {
            if entry.lsn <= state.last_lsn {
                continue;
            }
            state.version += 1;
            let version = state.version;
            apply_operations(&mut state.data, entry.operations, version);
            state.last_lsn = entry.lsn;
            replayed += 1;
        }
        info!(
            "Opened KV store at {}: {} keys, {} WAL entries replayed ({} corrupted)",
            config.data_dir.display(),
            state.data.len(),
            replayed,
            recovery.entries_corrupted
        );

        // Step 3: WAL writer
        let next_lsn = state.last_lsn.max(recovery.last_lsn) + 1;
        let writer = WalWriter::open_at(&wal_path, config.wal_sync_strategy, next_lsn)?;

        Ok(Self {
            store: Arc::new(Store {
                state: RwLock::new(state),
                wal: Mutex::new(Some(writer)),
                snapshot_path: Some(snapshot_path),
            }),
        })
    }

    /// Write a snapshot of all live keys and reset the WAL
    pub fn checkpoint(&self) -> Result<()> {
        let Some(snapshot_path) = &self.store.snapshot_path else {
            return Ok(());
        };

        let mut wal = self.store.wal.lock();
        let mut state = self.store.state.write();
        state.data.retain(|_, v| v.value.is_some());
        let snapshot = Snapshot {
            last_lsn: state.last_lsn,
            version: state.version,
            entries: state
                .data
                .iter()
                .filter_map(|(k, v)| v.value.as_ref().map(|b| (k.clone(), b.to_vec())))
                .collect(),
        };
        write_snapshot(snapshot_path, &snapshot)?;
        if let Some(writer) = wal.as_mut() {
            writer.reset()?;
        }
        debug!("Checkpoint written with {} keys at LSN {}", snapshot.entries.len(), snapshot.last_lsn);
        Ok(())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.store.state.read().data.values().filter(|v| v.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Driver for LocalDriver {
    async fn begin(&self, read_only: bool) -> Result<Box<dyn Transaction>> {
        let start_version = self.store.state.read().version;
        Ok(Box::new(LocalTransaction {
            store: Arc::clone(&self.store),
            start_version,
            read_only,
            open: true,
            writes: BTreeMap::new(),
            for_update: HashSet::new(),
        }))
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Transaction over a `LocalDriver`
pub struct LocalTransaction {
    store: Arc<Store>,
    start_version: u64,
    read_only: bool,
    open: bool,
    /// `None` marks a buffered delete
    writes: BTreeMap<String, Option<Bytes>>,
    for_update: HashSet<String>,
}

impl LocalTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(AtlasError::TransactionClosed)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(AtlasError::ReadOnlyTransaction);
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Option<Bytes> {
        if let Some(buffered) = self.writes.get(key) {
            return buffered.clone();
        }
        self.store.state.read().data.get(key).and_then(|v| v.value.clone())
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    fn is_open(&self) -> bool {
        self.open
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.read(key))
    }

    async fn get_for_update(&mut self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_writable()?;
        self.for_update.insert(key.to_string());
        Ok(self.read(key))
    }

    async fn set(&mut self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_writable()?;
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn insert(&mut self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_writable()?;
        if self.read(key).is_some() {
            return Err(AtlasError::Conflict(key.to_string()));
        }
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_writable()?;
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    async fn keys(&mut self, prefix: &str, count: Option<usize>) -> Result<KeyStream> {
        self.ensure_open()?;
        let mut keys: BTreeMap<String, bool> = {
            let state = self.store.state.read();
            state
                .data
                .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter(|(_, v)| v.value.is_some())
                .map(|(k, _)| (k.clone(), true))
                .collect()
        };
        for (key, value) in self.writes.range::<str, _>((Bound::Included(prefix), Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            keys.insert(key.clone(), value.is_some());
        }

        let limit = count.unwrap_or(usize::MAX);
        let keys: Vec<String> = keys
            .into_iter()
            .filter_map(|(k, live)| live.then_some(k))
            .take(limit)
            .collect();
        Ok(Box::pin(tokio_stream::iter(keys)))
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        if self.read_only || self.writes.is_empty() {
            return Ok(());
        }

        let writes = std::mem::take(&mut self.writes);
        let mut wal = self.store.wal.lock();
        let mut state = self.store.state.write();

        // Step 1: validate against commits made since begin
        for key in writes.keys().chain(self.for_update.iter()) {
            if let Some(current) = state.data.get(key) {
                if current.version > self.start_version {
                    debug!("Commit conflict on {} ({} > {})", key, current.version, self.start_version);
                    return Err(AtlasError::Conflict(key.clone()));
                }
            }
        }

        let operations: Vec<Operation> = writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => Operation::Put { key, value: value.to_vec() },
                None => Operation::Delete { key },
            })
            .collect();

        // Step 2: write-ahead
        if let Some(writer) = wal.as_mut() {
            state.last_lsn = writer.append(operations.clone())?;
        }

        // Step 3: apply
        state.version += 1;
        let version = state.version;
        apply_operations(&mut state.data, operations, version);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        self.writes.clear();
        self.for_update.clear();
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn apply_operations(data: &mut BTreeMap<String, Versioned>, operations: Vec<Operation>, version: u64) {
    for op in operations {
        match op {
            Operation::Put { key, value } => {
                data.insert(key, Versioned { value: Some(Bytes::from(value)), version });
            }
            Operation::Delete { key } => {
                data.insert(key, Versioned { value: None, version });
            }
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let body = bincode::serialize(snapshot)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&hasher.finalize().to_be_bytes())?;
        file.write_all(&(body.len() as u64).to_be_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 12 {
        return Err(AtlasError::WalCorruption(format!("snapshot {} truncated", path.display())));
    }

    let mut crc = [0u8; 4];
    let mut len = [0u8; 8];
    crc.copy_from_slice(&bytes[0..4]);
    len.copy_from_slice(&bytes[4..12]);
    let len = u64::from_be_bytes(len) as usize;
    let body = bytes
        .get(12..12 + len)
        .ok_or_else(|| AtlasError::WalCorruption(format!("snapshot {} truncated", path.display())))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != u32::from_be_bytes(crc) {
        return Err(AtlasError::WalCorruption(format!("snapshot {} CRC mismatch", path.display())));
    }
    Ok(bincode::deserialize(body)?)
}
