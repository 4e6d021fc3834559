//! Shard Module
//!
//! Logical shards of a KB and the index nodes that hold their replicas.
//!
//! ## Layout
//! ```text
//!   KbShards { actual ──┐ }
//!     shards[0]  ShardObject { shard: "3f2a..", replicas: [node-0/replica-id, ..] }
//!     shards[1]  ShardObject { ..}  ◄── new resources go here
//! ```
//!
//! A resource's logical shard is recorded once (`/kbs/{kbid}/r/{uuid}/shard`)
//! and every later index or delete operation fans out to that shard's
//! replicas.

mod local;
mod manager;

pub use local::{IndexedDocument, LocalIndexNode};
pub use manager::{shard_creation_lock, ShardManager};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::IndexMessage;

/// Counters reported by an index node for one shard replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub resources: u64,
    pub fields: u64,
    pub paragraphs: u64,
    pub sentences: u64,
}

/// Result of an add/delete on one replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStatus {
    pub shard_id: String,
    pub count: u64,
    pub fields: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReplica {
    pub node: String,
    pub shard_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardObject {
    /// Logical shard id, stable across replicas
    pub shard: String,
    pub replicas: Vec<ShardReplica>,
}

/// Shard list of one KB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbShards {
    pub kbid: String,
    /// Index of the writable shard; -1 until the first one exists
    pub actual: i32,
    pub shards: Vec<ShardObject>,
}

impl KbShards {
    pub fn new(kbid: impl Into<String>) -> Self {
        Self { kbid: kbid.into(), actual: -1, shards: Vec::new() }
    }

    pub fn active(&self) -> Option<&ShardObject> {
        usize::try_from(self.actual).ok().and_then(|i| self.shards.get(i))
    }

    pub fn find(&self, shard: &str) -> Option<&ShardObject> {
        self.shards.iter().find(|s| s.shard == shard)
    }

    pub fn push(&mut self, shard: ShardObject) {
        self.shards.push(shard);
        self.actual = self.shards.len() as i32 - 1;
    }
}

/// An index service node. Every call is a potentially slow request.
#[async_trait]
pub trait IndexNode: Send + Sync {
    fn id(&self) -> &str;

    /// Create a replica for `kbid`, returning its node-local id
    async fn new_shard(&self, kbid: &str) -> Result<String>;

    async fn delete_shard(&self, shard_id: &str) -> Result<()>;

    async fn add_resource(&self, shard_id: &str, message: &IndexMessage) -> Result<OpStatus>;

    async fn delete_resource(&self, shard_id: &str, uuid: &str) -> Result<OpStatus>;

    async fn list_shards(&self) -> Result<Vec<String>>;

    async fn get_shard(&self, shard_id: &str) -> Result<ShardInfo>;
}
