//! Processor Module
//!
//! Applies the ordered broker message stream of each partition to KB
//! resources, once per sequence id.
//!
//! ## Responsibilities
//! - Skip replays (`seqid <= last applied` for the partition)
//! - Dispatch by message type: DELETE, AUTOCOMMIT, MULTI, COMMIT, ROLLBACK
//! - Apply a batch in one KV transaction, index it on the resource's shard
//! - Deadletter failed batches and publish commit/abort notifications
//! - Report one audit event per processed message
//!
//! ## Batch Flow
//! ```text
//!   begin ──► KB exists? ──no──► record seqid, skip
//!               │yes
//!               ▼
//!   load / create resource ──► apply each message ──► modified? ──no──► abort, notify ABORT
//!                                                        │yes
//!                                                        ▼
//!   build index message ──► shard (rotate when full) ──► index ──► record seqid ──► commit
//!                                                                                    │
//!                                        slug mapping (own txn) ◄────────────────────┘
//!                                        notify COMMIT (lowest seqid of the batch)
//!
//!   any error ──► close txn ──► deadletter batch ──► notify ABORT ──► mark resource Error
//!                                                 ──► Deadlettered (or raw error for SYNC_SEQID)
//! ```
//!
//! ## MULTI Protocol
//! ```text
//!   (none) ──MULTI──► buffered ──MULTI──► buffered ──COMMIT──► applied as one batch
//!                         │
//!                         └──ROLLBACK──► dropped, notify ABORT
//! ```
//! Buffers live in memory only; an open MULTI does not survive a restart.

pub mod audit;
pub mod deadletter;
pub mod notify;
pub mod sequence;

pub use audit::{AuditEvent, AuditOutcome, AuditSink, LogAuditSink, MemoryAuditSink};
pub use deadletter::{DeadletterEntry, DeadletterStore, FileDeadletterStore, MemoryDeadletterStore};
pub use notify::{
    notification_channel, LocalPubSub, Notification, NotificationAction, PubSub, Published, WriteType,
};
pub use sequence::SYNC_SEQID;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::KbCache;
use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::index::{messages_source, trim_entity_facets, validate_indexable, IndexMessage, IndexMessageBuilder};
use crate::kv::{self, Driver, Transaction};
use crate::model::{BrokerMessage, ErrorSeverity, FieldId, MessageSource, MessageType, ResourceStatus};
use crate::orm::{KnowledgeBox, KnowledgeBoxConfig, Resource};
use crate::shard::{KbShards, ShardManager};

/// Why a batch was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The KB was deleted after the messages were produced
    KnowledgeBoxDeleted,
    /// Only secondary messages for a resource that does not exist here
    MissingResource,
    EmptyBatch,
}

/// Result of applying one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Applied { uuid: String, created: bool },
    /// Nothing changed; the transaction was aborted
    Unmodified,
    Skipped(SkipReason),
}

/// What `process` did with one message
#[derive(Debug)]
enum Handled {
    Txn(TxnOutcome),
    Deleted { uuid: String },
    Buffered,
    RolledBack,
    /// COMMIT/ROLLBACK without an open MULTI
    ProtocolViolation,
}

impl Handled {
    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Handled::Txn(TxnOutcome::Applied { created: true, .. }) => AuditOutcome::Created,
            Handled::Txn(TxnOutcome::Applied { created: false, .. }) => AuditOutcome::Modified,
            Handled::Txn(TxnOutcome::Unmodified) => AuditOutcome::Unmodified,
            Handled::Txn(TxnOutcome::Skipped(_)) => AuditOutcome::Skipped,
            Handled::Deleted { .. } => AuditOutcome::Deleted,
            Handled::Buffered => AuditOutcome::Buffered,
            Handled::RolledBack => AuditOutcome::RolledBack,
            Handled::ProtocolViolation => AuditOutcome::Failed,
        }
    }

    fn uuid(&self) -> Option<&str> {
        match self {
            Handled::Txn(TxnOutcome::Applied { uuid, .. }) | Handled::Deleted { uuid } => Some(uuid),
            _ => None,
        }
    }
}

/// Outcome of the work done inside the main transaction
enum BatchResult {
    Applied { resource: Resource, created: bool },
    Unmodified,
    KnowledgeBoxDeleted,
    MissingResource,
}

struct PendingMulti {
    created: Instant,
    messages: Vec<(i64, BrokerMessage)>,
}

/// The ingestion transaction engine
///
/// One instance serves any number of partitions. Messages of one partition
/// must be fed in order by a single consumer; different partitions may be
/// processed concurrently.
pub struct Processor {
    driver: Arc<dyn Driver>,
    shards: Arc<ShardManager>,
    pubsub: Arc<dyn PubSub>,
    audit: Arc<dyn AuditSink>,
    deadletter: Arc<dyn DeadletterStore>,
    cache: KbCache,
    /// Open MULTI buffers by multiid (never held across an await)
    multi: Mutex<HashMap<String, PendingMulti>>,
    config: Config,
}

impl Processor {
    pub fn new(
        driver: Arc<dyn Driver>,
        shards: Arc<ShardManager>,
        pubsub: Arc<dyn PubSub>,
        audit: Arc<dyn AuditSink>,
        deadletter: Arc<dyn DeadletterStore>,
        config: Config,
    ) -> Self {
        Self {
            driver,
            shards,
            pubsub,
            audit,
            deadletter,
            cache: KbCache::new(config.kb_cache_capacity),
            multi: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn shards(&self) -> &ShardManager {
        &self.shards
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    // =========================================================================
    // Entry Point
    // =========================================================================

    /// Apply `message` at `seqid` of `partition`.
    ///
    /// Returns `false` when the sequence id was applied already. Every call
    /// past that check reports exactly one audit event, failures included.
    #[instrument(skip_all, fields(kbid = %message.kbid, partition = %partition, seqid = seqid))]
    pub async fn process(&self, message: BrokerMessage, seqid: i64, partition: &str) -> Result<bool> {
        if let Some(max_age) = self.config.multi_max_age_ms {
            self.sweep_multi(Duration::from_millis(max_age));
        }

        if seqid != SYNC_SEQID {
            let last = self.last_seqid(partition).await?;
            if sequence::is_replay(last, seqid) {
                debug!(last = ?last, "Message already applied; skipping");
                return Ok(false);
            }
        }

        let kbid = message.kbid.clone();
        let uuid = message.uuid.clone();
        let message_type = message.message_type;
        let source = message.source;

        let result = match message_type {
            MessageType::Delete => self.delete_resource(&message, seqid, partition).await,
            MessageType::Autocommit => self
                .txn(std::slice::from_ref(&message), seqid, partition)
                .await
                .map(Handled::Txn),
            MessageType::Multi => self.multi(message, seqid, partition).await,
            MessageType::Commit => self.commit(message, seqid, partition).await,
            MessageType::Rollback => self.rollback(&message, seqid, partition).await,
        };

        let (outcome, uuid) = match &result {
            Ok(handled) => (handled.audit_outcome(), handled.uuid().map(str::to_string).unwrap_or(uuid)),
            Err(_) => (AuditOutcome::Failed, uuid),
        };
        self.audit
            .report(AuditEvent::new(kbid, uuid, partition, seqid, message_type, source, outcome))
            .await;

        result.map(|_| true)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Apply `messages` as one atomic batch
    #[instrument(skip_all, fields(partition = %partition, seqid = seqid, batch = messages.len()))]
    pub async fn txn(&self, messages: &[BrokerMessage], seqid: i64, partition: &str) -> Result<TxnOutcome> {
        self.txn_inner(messages, seqid, seqid, partition).await
    }

    async fn txn_inner(
        &self,
        messages: &[BrokerMessage],
        seqid: i64,
        first_seqid: i64,
        partition: &str,
    ) -> Result<TxnOutcome> {
        let Some(first) = messages.first() else {
            self.record_seqid(partition, seqid).await?;
            return Ok(TxnOutcome::Skipped(SkipReason::EmptyBatch));
        };

        let mut txn = self.driver.begin(false).await?;
        let result = self.apply_batch(txn.as_mut(), messages, seqid, partition).await;
        kv::close(txn.as_mut()).await;

        match result {
            Ok(BatchResult::Applied { resource, created }) => {
                let uuid = resource.uuid().to_string();
                if created {
                    self.commit_slug(resource.kbid(), resource.slug(), &uuid).await;
                }
                let write_type = if created { WriteType::Created } else { WriteType::Modified };
                self.notify(first, &uuid, partition, first_seqid, NotificationAction::Commit, Some(write_type))
                    .await;
                info!(uuid = %uuid, created, "Applied batch");
                Ok(TxnOutcome::Applied { uuid, created })
            }
            Ok(BatchResult::Unmodified) => {
                debug!("Batch did not modify the resource");
                self.notify(first, &first.uuid, partition, first_seqid, NotificationAction::Abort, None)
                    .await;
                self.record_seqid(partition, seqid).await?;
                Ok(TxnOutcome::Unmodified)
            }
            Ok(BatchResult::KnowledgeBoxDeleted) => {
                info!(kbid = %first.kbid, "Knowledge box no longer exists; skipping batch");
                Ok(TxnOutcome::Skipped(SkipReason::KnowledgeBoxDeleted))
            }
            Ok(BatchResult::MissingResource) => Ok(TxnOutcome::Skipped(SkipReason::MissingResource)),
            Err(e) => {
                error!(kbid = %first.kbid, uuid = %first.uuid, "Batch failed: {}", e);
                self.deadletter_batch(partition, seqid, messages).await;
                self.notify(first, &first.uuid, partition, first_seqid, NotificationAction::Abort, None)
                    .await;
                if seqid == SYNC_SEQID {
                    return Err(e);
                }
                self.mark_resource_error(&first.kbid, &first.uuid).await;
                Err(AtlasError::Deadlettered {
                    partition: partition.to_string(),
                    seqid,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Everything that happens inside the main transaction. Skips commit
    /// their sequence bookkeeping here; `Unmodified` leaves it to the caller.
    async fn apply_batch(
        &self,
        txn: &mut dyn Transaction,
        messages: &[BrokerMessage],
        seqid: i64,
        partition: &str,
    ) -> Result<BatchResult> {
        let first = messages
            .first()
            .ok_or_else(|| AtlasError::InvalidMessage("empty batch".into()))?;
        let kbid = first.kbid.as_str();

        let Some(kb_config) = self.kb_config(txn, kbid).await? else {
            self.commit_seqid_only(txn, partition, seqid).await?;
            return Ok(BatchResult::KnowledgeBoxDeleted);
        };
        let source = messages_source(messages)?;
        let kb = KnowledgeBox::new(kbid);
        let uuid = resolve_uuid(txn, &kb, first).await?;

        let mut resource = kb.get(txn, &uuid).await?;
        let mut created = false;
        for message in messages {
            let mut fresh = false;
            if resource.is_none() {
                if message.source != MessageSource::Writer || message.txseqid > 0 {
                    info!(uuid = %uuid, txseqid = message.txseqid, "Resource not found for secondary message; ignoring it");
                    continue;
                }
                resource = Some(kb.add_resource(txn, &uuid, &message.slug, message.basic.as_ref()).await?);
                created = true;
                fresh = true;
            }
            let Some(res) = resource.as_mut() else {
                continue;
            };

            if !fresh {
                if let Some(basic) = &message.basic {
                    res.set_basic(txn, basic).await?;
                }
            }
            if let Some(origin) = &message.origin {
                res.set_origin(txn, origin).await?;
            }
            if let Some(security) = &message.security {
                res.set_security(txn, security).await?;
            }
            res.apply_fields(txn, message).await?;
            res.apply_extracted(txn, message, &kb_config.vectorsets).await?;
        }

        let Some(mut resource) = resource else {
            self.commit_seqid_only(txn, partition, seqid).await?;
            return Ok(BatchResult::MissingResource);
        };
        if !resource.modified {
            return Ok(BatchResult::Unmodified);
        }

        let builder = IndexMessageBuilder::new(&resource, kb_config.vectorsets.clone());
        let brain = match source {
            MessageSource::Writer => builder.for_writer_bm(txn, messages, created).await?,
            MessageSource::Processor => builder.for_processor_bm(txn, messages).await?,
        };
        match self.index(txn, kbid, &uuid, brain).await {
            Ok(warnings) => {
                for (field_key, warning) in warnings {
                    if let Some(field) = FieldId::parse(&field_key) {
                        resource.add_field_error(txn, &field, warning, ErrorSeverity::Warning).await?;
                    }
                }
            }
            // Committed without an index update
            Err(AtlasError::ResourceNotIndexable { field, reason, .. }) => {
                warn!(uuid = %uuid, field = %field, "Resource is not indexable: {}", reason);
                if let Some(field) = FieldId::parse(&field) {
                    resource.add_field_error(txn, &field, reason, ErrorSeverity::Error).await?;
                }
                resource.set_status(txn, ResourceStatus::Error).await?;
            }
            Err(e) => return Err(e),
        }

        if seqid != SYNC_SEQID {
            resource.set_last_seqid(txn, seqid).await?;
            sequence::set_last_seqid(txn, partition, seqid).await?;
        }
        txn.commit().await?;
        Ok(BatchResult::Applied { resource, created })
    }

    /// Validate `brain` and send it to the resource's shard, returning the
    /// per-field facet trimming warnings
    async fn index(
        &self,
        txn: &mut dyn Transaction,
        kbid: &str,
        uuid: &str,
        mut brain: IndexMessage,
    ) -> Result<Vec<(String, String)>> {
        validate_indexable(&brain, self.config.max_resource_paragraphs)?;
        let warnings = trim_entity_facets(&mut brain, self.config.max_entity_facets);
        for (field, warning) in &warnings {
            warn!(uuid, field = %field, "{}", warning);
        }
        let shard = self.shards.get_or_assign_resource_shard(txn, kbid, uuid).await?;
        let status = self.shards.add_resource(&shard, &brain).await?;
        debug!(uuid, shard = %shard.shard, fields = status.fields, "Indexed resource");
        Ok(warnings)
    }

    async fn commit_seqid_only(&self, txn: &mut dyn Transaction, partition: &str, seqid: i64) -> Result<()> {
        if seqid != SYNC_SEQID {
            sequence::set_last_seqid(txn, partition, seqid).await?;
        }
        txn.commit().await
    }

    // =========================================================================
    // Message Types
    // =========================================================================

    async fn delete_resource(&self, message: &BrokerMessage, seqid: i64, partition: &str) -> Result<Handled> {
        let kb = KnowledgeBox::new(message.kbid.as_str());
        let mut txn = self.driver.begin(false).await?;
        let result: Result<Option<String>> = async {
            let mut uuid = existing_uuid(txn.as_mut(), &kb, message).await?;
            let mut shard_id = None;
            if let Some(candidate) = &uuid {
                // The shard record can outlive the basic record
                shard_id = kb.get_resource_shard_id(txn.as_mut(), candidate).await?;
                if shard_id.is_none() && kb.get(txn.as_mut(), candidate).await?.is_none() {
                    uuid = None;
                }
            }

            if let Some(uuid) = &uuid {
                match shard_id {
                    Some(shard_id) => {
                        let shard = ShardManager::get_shards(txn.as_mut(), kb.kbid())
                            .await?
                            .and_then(|shards| shards.find(&shard_id).cloned())
                            .ok_or(AtlasError::ShardNotFound(shard_id))?;
                        self.shards.delete_resource(&shard, uuid).await?;
                    }
                    None => warn!(uuid = %uuid, "Resource has no shard assigned"),
                }
                kb.delete_resource(txn.as_mut(), uuid).await?;
            } else {
                warn!(uuid = %message.uuid, slug = %message.slug, "Resource to delete does not exist");
            }

            if seqid != SYNC_SEQID {
                sequence::set_last_seqid(txn.as_mut(), partition, seqid).await?;
            }
            txn.commit().await?;
            Ok(uuid)
        }
        .await;
        kv::close(txn.as_mut()).await;

        match result {
            Ok(Some(uuid)) => {
                self.notify(message, &uuid, partition, seqid, NotificationAction::Commit, Some(WriteType::Deleted))
                    .await;
                info!(uuid = %uuid, "Deleted resource");
                Ok(Handled::Deleted { uuid })
            }
            Ok(None) => Ok(Handled::Txn(TxnOutcome::Skipped(SkipReason::MissingResource))),
            Err(e) => {
                error!(uuid = %message.uuid, "Delete failed: {}", e);
                self.notify(message, &message.uuid, partition, seqid, NotificationAction::Abort, None)
                    .await;
                Err(e)
            }
        }
    }

    async fn multi(&self, message: BrokerMessage, seqid: i64, partition: &str) -> Result<Handled> {
        let multiid = message.multiid.clone();
        let buffered = {
            let mut pending = self.multi.lock();
            let entry = pending.entry(multiid.clone()).or_insert_with(|| PendingMulti {
                created: Instant::now(),
                messages: Vec::new(),
            });
            entry.messages.push((seqid, message));
            entry.messages.len()
        };
        debug!(multiid = %multiid, buffered, "Buffered MULTI message");
        self.record_seqid(partition, seqid).await?;
        Ok(Handled::Buffered)
    }

    async fn commit(&self, message: BrokerMessage, seqid: i64, partition: &str) -> Result<Handled> {
        let pending = self.multi.lock().remove(&message.multiid);
        let Some(pending) = pending else {
            error!(multiid = %message.multiid, "COMMIT without an open MULTI");
            self.deadletter_batch(partition, seqid, std::slice::from_ref(&message)).await;
            self.notify(&message, &message.uuid, partition, seqid, NotificationAction::Abort, None)
                .await;
            self.record_seqid(partition, seqid).await?;
            return Ok(Handled::ProtocolViolation);
        };

        let first_seqid = pending.messages.iter().map(|(s, _)| *s).min().unwrap_or(seqid);
        let mut messages: Vec<BrokerMessage> = pending.messages.into_iter().map(|(_, m)| m).collect();
        messages.push(message);
        let outcome = self.txn_inner(&messages, seqid, first_seqid, partition).await?;
        Ok(Handled::Txn(outcome))
    }

    async fn rollback(&self, message: &BrokerMessage, seqid: i64, partition: &str) -> Result<Handled> {
        let pending = self.multi.lock().remove(&message.multiid);
        let handled = match pending {
            Some(pending) => {
                info!(multiid = %message.multiid, dropped = pending.messages.len(), "Rolled back MULTI");
                self.notify(message, &message.uuid, partition, seqid, NotificationAction::Abort, None)
                    .await;
                Handled::RolledBack
            }
            None => {
                error!(multiid = %message.multiid, "ROLLBACK without an open MULTI");
                self.deadletter_batch(partition, seqid, std::slice::from_ref(message)).await;
                self.notify(message, &message.uuid, partition, seqid, NotificationAction::Abort, None)
                    .await;
                Handled::ProtocolViolation
            }
        };
        self.record_seqid(partition, seqid).await?;
        Ok(handled)
    }

    /// Drop open MULTI buffers older than `max_age`; returns how many
    pub fn sweep_multi(&self, max_age: Duration) -> usize {
        let mut pending = self.multi.lock();
        let before = pending.len();
        pending.retain(|multiid, buffer| {
            let keep = buffer.created.elapsed() < max_age;
            if !keep {
                warn!(multiid = %multiid, messages = buffer.messages.len(), "Dropping stale MULTI");
            }
            keep
        });
        before - pending.len()
    }

    /// Multiids with an open buffer
    pub fn pending_multi(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.multi.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Side Effects
    // =========================================================================

    async fn notify(
        &self,
        message: &BrokerMessage,
        uuid: &str,
        partition: &str,
        seqid: i64,
        action: NotificationAction,
        write_type: Option<WriteType>,
    ) {
        let notification = Notification {
            partition: partition.to_string(),
            seqid,
            multi: message.multiid.clone(),
            uuid: uuid.to_string(),
            kbid: message.kbid.clone(),
            action,
            write_type,
            source: message.source,
        };
        let published = match notification.encode() {
            Ok(payload) => {
                self.pubsub
                    .publish(&notification_channel(&message.kbid), Bytes::from(payload))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(kbid = %message.kbid, "Failed to publish notification: {}", e);
        }
    }

    async fn deadletter_batch(&self, partition: &str, seqid: i64, messages: &[BrokerMessage]) {
        for (index, message) in messages.iter().enumerate() {
            if let Err(e) = self.deadletter.deadletter(partition, seqid, index, message).await {
                error!(partition, seqid, index, "Failed to deadletter message: {}", e);
            }
        }
        error!(partition, seqid, messages = messages.len(), "Deadlettered batch");
    }

    /// Best effort: flag the resource so operators can find it
    async fn mark_resource_error(&self, kbid: &str, uuid: &str) {
        if uuid.is_empty() {
            return;
        }
        let mut txn = match self.driver.begin(false).await {
            Ok(txn) => txn,
            Err(e) => {
                warn!(kbid, uuid, "Could not mark resource as errored: {}", e);
                return;
            }
        };
        let result: Result<bool> = async {
            let Some(mut resource) = Resource::load(txn.as_mut(), kbid, uuid).await? else {
                return Ok(false);
            };
            resource.set_status(txn.as_mut(), ResourceStatus::Error).await?;
            txn.commit().await?;
            Ok(true)
        }
        .await;
        kv::close(txn.as_mut()).await;
        match result {
            Ok(true) => debug!(kbid, uuid, "Marked resource as errored"),
            Ok(false) => {}
            Err(e) => warn!(kbid, uuid, "Could not mark resource as errored: {}", e),
        }
    }

    /// Slug keys are written after the main commit, in their own transaction
    async fn commit_slug(&self, kbid: &str, slug: &str, uuid: &str) {
        if slug.is_empty() {
            return;
        }
        let result: Result<()> = async {
            let mut txn = self.driver.begin(false).await?;
            let written: Result<()> = async {
                KnowledgeBox::new(kbid).set_resource_slug(txn.as_mut(), slug, uuid).await?;
                txn.commit().await
            }
            .await;
            kv::close(txn.as_mut()).await;
            written
        }
        .await;
        if let Err(e) = result {
            warn!(kbid, uuid, slug, "Failed to write slug mapping: {}", e);
        }
    }

    /// Rewrite the slug mapping of a resource whose slug commit was lost.
    /// Returns whether anything was written.
    pub async fn repair_slug(&self, kbid: &str, uuid: &str) -> Result<bool> {
        let kb = KnowledgeBox::new(kbid);
        let mut txn = self.driver.begin(false).await?;
        let result: Result<bool> = async {
            let Some(resource) = kb.get(txn.as_mut(), uuid).await? else {
                return Err(AtlasError::ResourceNotFound(uuid.to_string()));
            };
            let slug = resource.slug().to_string();
            if slug.is_empty() {
                return Ok(false);
            }
            match kb.get_resource_uuid_by_slug(txn.as_mut(), &slug).await? {
                Some(owner) if owner == uuid => return Ok(false),
                Some(owner) => {
                    warn!(kbid, slug = %slug, owner = %owner, "Slug belongs to another resource; not repairing");
                    return Ok(false);
                }
                None => {}
            }
            kb.set_resource_slug(txn.as_mut(), &slug, uuid).await?;
            txn.commit().await?;
            info!(kbid, uuid, slug = %slug, "Repaired slug mapping");
            Ok(true)
        }
        .await;
        kv::close(txn.as_mut()).await;
        result
    }

    /// Rebuild the whole index message of a resource and replace it on its shard
    pub async fn reindex_resource(&self, kbid: &str, uuid: &str) -> Result<()> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<()> = async {
            let config = self
                .kb_config(txn.as_mut(), kbid)
                .await?
                .ok_or_else(|| AtlasError::KnowledgeBoxNotFound(kbid.to_string()))?;
            let resource = Resource::load(txn.as_mut(), kbid, uuid)
                .await?
                .ok_or_else(|| AtlasError::ResourceNotFound(uuid.to_string()))?;
            let brain = IndexMessageBuilder::new(&resource, config.vectorsets.clone())
                .full(txn.as_mut(), true)
                .await?;
            self.index(txn.as_mut(), kbid, uuid, brain).await?;
            txn.commit().await
        }
        .await;
        kv::close(txn.as_mut()).await;
        result
    }

    async fn record_seqid(&self, partition: &str, seqid: i64) -> Result<()> {
        if seqid == SYNC_SEQID {
            return Ok(());
        }
        let mut txn = self.driver.begin(false).await?;
        let result = self.commit_seqid_only(txn.as_mut(), partition, seqid).await;
        kv::close(txn.as_mut()).await;
        result
    }

    pub async fn last_seqid(&self, partition: &str) -> Result<Option<i64>> {
        let mut txn = self.driver.begin(true).await?;
        let result = sequence::get_last_seqid(txn.as_mut(), partition).await;
        kv::close(txn.as_mut()).await;
        result
    }

    /// The KB's config as seen by `txn`; `None` once the KB is gone
    async fn kb_config(&self, txn: &mut dyn Transaction, kbid: &str) -> Result<Option<Arc<KnowledgeBoxConfig>>> {
        self.cache.get_or_load(txn, kbid).await
    }

    // =========================================================================
    // Knowledge Box Administration
    // =========================================================================

    /// Create a KB together with its first shard. If the shard cannot be
    /// created the KB is removed again.
    pub async fn create_kb(
        &self,
        slug: &str,
        config: KnowledgeBoxConfig,
        forced_uuid: Option<String>,
    ) -> Result<String> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<String> = async {
            let kbid = KnowledgeBox::create(txn.as_mut(), slug, config, forced_uuid).await?;
            txn.commit().await?;
            Ok(kbid)
        }
        .await;
        kv::close(txn.as_mut()).await;
        let kbid = result?;

        if let Err(e) = self.shards.create_shard_by_kbid(&kbid).await {
            error!(kbid = %kbid, "Shard creation failed; removing knowledge box: {}", e);
            if let Err(cleanup) = self.delete_kb(&kbid).await {
                error!(kbid = %kbid, "Failed to remove knowledge box: {}", cleanup);
            }
            return Err(e);
        }
        Ok(kbid)
    }

    pub async fn update_kb(&self, kbid: &str, slug: Option<&str>, config: KnowledgeBoxConfig) -> Result<String> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<String> = async {
            let kbid = KnowledgeBox::update(txn.as_mut(), kbid, slug, config).await?;
            txn.commit().await?;
            Ok(kbid)
        }
        .await;
        kv::close(txn.as_mut()).await;
        self.cache.invalidate(kbid);
        result
    }

    /// Remove every record of the KB, then its shards
    pub async fn delete_kb(&self, kbid: &str) -> Result<()> {
        let mut txn = self.driver.begin(false).await?;
        let result: Result<Option<KbShards>> = async {
            let shards = ShardManager::get_shards(txn.as_mut(), kbid).await?;
            KnowledgeBox::delete(txn.as_mut(), kbid).await?;
            txn.commit().await?;
            Ok(shards)
        }
        .await;
        kv::close(txn.as_mut()).await;
        self.cache.invalidate(kbid);

        if let Some(shards) = result? {
            self.shards.delete_kb_shards(&shards).await;
        }
        Ok(())
    }

    /// `(slug, kbid)` pairs whose slug starts with `prefix`
    pub async fn list_kbs(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut txn = self.driver.begin(true).await?;
        let result = KnowledgeBox::list(txn.as_mut(), prefix).await;
        kv::close(txn.as_mut()).await;
        result
    }

    pub async fn get_kb(&self, kbid: &str) -> Result<Option<KnowledgeBoxConfig>> {
        let mut txn = self.driver.begin(true).await?;
        let result = KnowledgeBox::get_config(txn.as_mut(), kbid).await;
        kv::close(txn.as_mut()).await;
        result
    }

    pub async fn get_kb_by_slug(&self, slug: &str) -> Result<Option<String>> {
        let mut txn = self.driver.begin(true).await?;
        let result = KnowledgeBox::get_kbid_by_slug(txn.as_mut(), slug).await;
        kv::close(txn.as_mut()).await;
        result
    }
}

/// Uuid of the batch's resource: explicit, by slug, or a new one
async fn resolve_uuid(txn: &mut dyn Transaction, kb: &KnowledgeBox, first: &BrokerMessage) -> Result<String> {
    Ok(match existing_uuid(txn, kb, first).await? {
        Some(uuid) => uuid,
        None => Uuid::new_v4().simple().to_string(),
    })
}

async fn existing_uuid(txn: &mut dyn Transaction, kb: &KnowledgeBox, message: &BrokerMessage) -> Result<Option<String>> {
    if !message.uuid.is_empty() {
        return Ok(Some(message.uuid.clone()));
    }
    if message.slug.is_empty() {
        return Ok(None);
    }
    kb.get_resource_uuid_by_slug(txn, &message.slug).await
}
