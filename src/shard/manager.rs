//! Logical shard bookkeeping
//!
//! Shard creation is serialized per KB with the `shard-creation-{kbid}`
//! lock and committed in its own short transaction, so a shard created for a
//! batch that later fails is simply reused by the next one.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::index::IndexMessage;
use crate::keys;
use crate::kv::{self, Driver, Transaction};
use crate::lock::{distributed_lock, LockConfig};
use crate::orm::KnowledgeBox;
use super::{IndexNode, KbShards, OpStatus, ShardObject, ShardReplica};

pub fn shard_creation_lock(kbid: &str) -> String {
    format!("shard-creation-{}", kbid)
}

/// Whether a shard created meanwhile by someone else may be used instead
#[derive(Debug, Clone, Copy)]
enum Reuse<'a> {
    Never,
    /// Reuse the active shard unless it is still the one we saw
    UnlessActiveIs(Option<&'a str>),
}

pub struct ShardManager {
    driver: Arc<dyn Driver>,
    nodes: Vec<Arc<dyn IndexNode>>,
    lock_config: LockConfig,
    max_node_fields: u64,
    replicas: usize,
}

impl ShardManager {
    pub fn new(driver: Arc<dyn Driver>, nodes: Vec<Arc<dyn IndexNode>>, config: &Config) -> Self {
        Self {
            driver,
            nodes,
            lock_config: config.lock_config(),
            max_node_fields: config.max_node_fields,
            replicas: config.shard_replicas.max(1),
        }
    }

    pub fn nodes(&self) -> &[Arc<dyn IndexNode>] {
        &self.nodes
    }

    fn node(&self, id: &str) -> Result<&Arc<dyn IndexNode>> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .ok_or_else(|| AtlasError::Index(format!("index node {} is not registered", id)))
    }

    // =========================================================================
    // Shard Records
    // =========================================================================

    pub async fn get_shards(txn: &mut dyn Transaction, kbid: &str) -> Result<Option<KbShards>> {
        kv::get_record(txn, &keys::kb_shards(kbid)).await
    }

    pub async fn get_current_active_shard(txn: &mut dyn Transaction, kbid: &str) -> Result<Option<ShardObject>> {
        Ok(Self::get_shards(txn, kbid).await?.and_then(|s| s.active().cloned()))
    }

    /// Shard holding `uuid`, assigning the active one (rotating it first if
    /// it is full) when the resource has none yet
    pub async fn get_or_assign_resource_shard(
        &self,
        txn: &mut dyn Transaction,
        kbid: &str,
        uuid: &str,
    ) -> Result<ShardObject> {
        let kb = KnowledgeBox::new(kbid);
        if let Some(shard_id) = kb.get_resource_shard_id(txn, uuid).await? {
            return Self::get_shards(txn, kbid)
                .await?
                .and_then(|shards| shards.find(&shard_id).cloned())
                .ok_or(AtlasError::ShardNotFound(shard_id));
        }

        let shard = match Self::get_current_active_shard(txn, kbid).await? {
            Some(active) if !self.should_create_new_shard(&active).await? => active,
            seen => {
                let seen = seen.map(|s| s.shard);
                self.create_shard(kbid, Reuse::UnlessActiveIs(seen.as_deref())).await?
            }
        };
        kb.set_resource_shard_id(txn, uuid, &shard.shard).await?;
        debug!(kbid, uuid, shard = %shard.shard, "Assigned resource to shard");
        Ok(shard)
    }

    pub async fn should_create_new_shard(&self, shard: &ShardObject) -> Result<bool> {
        let Some(replica) = shard.replicas.first() else {
            return Ok(true);
        };
        let info = self.node(&replica.node)?.get_shard(&replica.shard_id).await?;
        let full = info.fields > self.max_node_fields;
        if full {
            info!(shard = %shard.shard, fields = info.fields, max = self.max_node_fields, "Shard is full");
        }
        Ok(full)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Append a new shard to the KB and make it the active one
    pub async fn create_shard_by_kbid(&self, kbid: &str) -> Result<ShardObject> {
        self.create_shard(kbid, Reuse::Never).await
    }

    async fn create_shard(&self, kbid: &str, reuse: Reuse<'_>) -> Result<ShardObject> {
        let guard = distributed_lock(Arc::clone(&self.driver), &shard_creation_lock(kbid), &self.lock_config).await?;
        let result = self.create_shard_locked(kbid, reuse).await;
        if let Err(e) = guard.release().await {
            warn!(kbid, "Failed to release shard creation lock: {}", e);
        }
        result
    }

    async fn create_shard_locked(&self, kbid: &str, reuse: Reuse<'_>) -> Result<ShardObject> {
        let key = keys::kb_shards(kbid);
        let mut txn = self.driver.begin(false).await?;
        let result: Result<ShardObject> = async {
            let mut shards = match txn.get_for_update(&key).await? {
                Some(bytes) => bincode::deserialize(&bytes)?,
                None => KbShards::new(kbid),
            };

            if let (Reuse::UnlessActiveIs(seen), Some(active)) = (reuse, shards.active()) {
                if seen != Some(active.shard.as_str()) {
                    debug!(kbid, shard = %active.shard, "Shard was created concurrently; reusing it");
                    return Ok(active.clone());
                }
            }

            let shard = self.create_replicas(kbid, &shards).await?;
            shards.push(shard.clone());
            kv::set_record(txn.as_mut(), &key, &shards).await?;
            if let Err(e) = txn.commit().await {
                self.rollback_shard(&shard).await;
                return Err(e);
            }
            info!(kbid, shard = %shard.shard, total = shards.shards.len(), "Created shard");
            Ok(shard)
        }
        .await;
        kv::close(txn.as_mut()).await;
        result
    }

    /// Create one replica on each of the least loaded nodes, preferring nodes
    /// that hold none of the KB's shards yet
    async fn create_replicas(&self, kbid: &str, shards: &KbShards) -> Result<ShardObject> {
        let used: HashSet<&str> = shards
            .shards
            .iter()
            .flat_map(|s| s.replicas.iter())
            .map(|r| r.node.as_str())
            .collect();

        let mut candidates = Vec::new();
        for node in &self.nodes {
            match node.list_shards().await {
                Ok(existing) => candidates.push((used.contains(node.id()), existing.len(), node)),
                Err(e) => warn!(node = %node.id(), "Index node unavailable: {}", e),
            }
        }
        if candidates.len() < self.replicas {
            error!(kbid, available = candidates.len(), required = self.replicas, "Not enough index nodes");
            return Err(AtlasError::NoIndexNodes);
        }
        candidates.sort_by_key(|(used, count, _)| (*used, *count));

        let mut shard = ShardObject { shard: Uuid::new_v4().simple().to_string(), replicas: Vec::new() };
        for (_, _, node) in candidates.into_iter().take(self.replicas) {
            match node.new_shard(kbid).await {
                Ok(shard_id) => shard.replicas.push(ShardReplica { node: node.id().to_string(), shard_id }),
                Err(e) => {
                    error!(kbid, node = %node.id(), "Replica creation failed: {}", e);
                    self.rollback_shard(&shard).await;
                    return Err(e);
                }
            }
        }
        Ok(shard)
    }

    async fn rollback_shard(&self, shard: &ShardObject) {
        warn!(shard = %shard.shard, replicas = shard.replicas.len(), "Rolling back shard");
        self.delete_replicas(shard).await;
    }

    async fn delete_replicas(&self, shard: &ShardObject) {
        for replica in &shard.replicas {
            let deleted = match self.node(&replica.node) {
                Ok(node) => node.delete_shard(&replica.shard_id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                error!(shard = %replica.shard_id, node = %replica.node, "Failed to delete shard replica: {}", e);
            }
        }
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Index `message` on every replica; the status with the most fields wins
    pub async fn add_resource(&self, shard: &ShardObject, message: &IndexMessage) -> Result<OpStatus> {
        let mut best: Option<OpStatus> = None;
        for replica in &shard.replicas {
            let mut message = message.clone();
            message.resource.shard_id = replica.shard_id.clone();
            let status = self.node(&replica.node)?.add_resource(&replica.shard_id, &message).await?;
            if best.as_ref().map(|b| status.fields > b.fields).unwrap_or(true) {
                best = Some(status);
            }
        }
        best.ok_or_else(|| AtlasError::ShardNotFound(shard.shard.clone()))
    }

    pub async fn delete_resource(&self, shard: &ShardObject, uuid: &str) -> Result<()> {
        for replica in &shard.replicas {
            self.node(&replica.node)?.delete_resource(&replica.shard_id, uuid).await?;
        }
        Ok(())
    }

    /// Remove the KB's shard list and every resource's shard assignment, so
    /// the next indexing creates fresh shards. Returns the resources unassigned.
    pub async fn forget_shards(txn: &mut dyn Transaction, kbid: &str) -> Result<usize> {
        let kb = KnowledgeBox::new(kbid);
        txn.delete(&keys::kb_shards(kbid)).await?;
        let mut unassigned = 0;
        for uuid in kb.resource_uuids(txn).await? {
            if kb.get_resource_shard_id(txn, &uuid).await?.is_some() {
                txn.delete(&keys::resource_shard(kbid, &uuid)).await?;
                unassigned += 1;
            }
        }
        debug!(kbid, unassigned, "Forgot KB shards");
        Ok(unassigned)
    }

    /// Drop every replica of a deleted KB. Failures are logged only.
    pub async fn delete_kb_shards(&self, shards: &KbShards) {
        for shard in &shards.shards {
            self.delete_replicas(shard).await;
        }
        info!(kbid = %shards.kbid, shards = shards.shards.len(), "Deleted KB shards");
    }
}
