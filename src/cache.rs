//! Bounded per-KB configuration cache
//!
//! An explicit LRU owned by whoever needs it (the processor), never a
//! process-wide singleton. Each entry remembers the raw config record it
//! was decoded from; a lookup reads the record through the caller's
//! transaction and reuses the entry only while the bytes still match, so
//! updates made by other processes are picked up on the next batch.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::Result;
use crate::keys;
use crate::kv::Transaction;
use crate::orm::KnowledgeBoxConfig;

struct Entry {
    raw: Bytes,
    config: Arc<KnowledgeBoxConfig>,
}

pub struct KbCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl KbCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, kbid: &str) -> Option<Arc<KnowledgeBoxConfig>> {
        self.entries.lock().get(kbid).map(|entry| Arc::clone(&entry.config))
    }

    /// Config as stored in `txn`, decoded again only when the record changed
    /// since it was cached. A missing KB drops its entry.
    pub async fn get_or_load(
        &self,
        txn: &mut dyn Transaction,
        kbid: &str,
    ) -> Result<Option<Arc<KnowledgeBoxConfig>>> {
        let Some(raw) = txn.get(&keys::kb_config(kbid)).await? else {
            self.invalidate(kbid);
            return Ok(None);
        };
        if let Some(entry) = self.entries.lock().get(kbid) {
            if entry.raw == raw {
                return Ok(Some(Arc::clone(&entry.config)));
            }
        }
        let config = Arc::new(bincode::deserialize::<KnowledgeBoxConfig>(&raw)?);
        self.entries.lock().put(
            kbid.to_string(),
            Entry { raw, config: Arc::clone(&config) },
        );
        Ok(Some(config))
    }

    pub fn invalidate(&self, kbid: &str) {
        self.entries.lock().pop(kbid);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
