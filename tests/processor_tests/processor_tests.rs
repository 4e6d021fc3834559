//! Tests for the ingestion processor
//!
//! These tests verify:
//! - Exactly-once application per partition sequence id
//! - AUTOCOMMIT, DELETE and the MULTI/COMMIT/ROLLBACK protocol
//! - Skips for deleted KBs and secondary messages of missing resources
//! - Deadlettering, abort notifications and error marking on failure
//! - Resources over the index limits are stored with field errors
//! - Shard rotation, slug repair and reindexing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use atlaskb::index::IndexMessage;
use atlaskb::kv::{Driver, LocalDriver};
use atlaskb::model::{
    Basic, BrokerMessage, Entity, ErrorSeverity, ExtractedText, ExtractedTextWrapper,
    ExtractedVectorsWrapper, FieldComputedMetadata, FieldId, FieldMetadata, FieldMetadataWrapper,
    FieldType, FieldValue, MessageSource, MessageType, Paragraph, ResourceStatus, Vector,
    VectorObject,
};
use atlaskb::orm::{KnowledgeBox, KnowledgeBoxConfig, Resource, VectorSetConfig};
use atlaskb::processor::{
    AuditOutcome, AuditSink, DeadletterStore, LocalPubSub, MemoryAuditSink, MemoryDeadletterStore,
    Notification, NotificationAction, Published, WriteType,
};
use atlaskb::shard::{IndexNode, OpStatus, ShardInfo};
use atlaskb::{keys, AtlasError, Config, LocalIndexNode, Processor, ShardManager, SYNC_SEQID};

// =============================================================================
// Helper Functions
// =============================================================================

const KBID: &str = "kb1";
const PARTITION: &str = "0";

/// Index node whose indexing can be switched off
struct FlakyNode {
    inner: LocalIndexNode,
    fail_add_resource: AtomicBool,
}

#[async_trait]
impl IndexNode for FlakyNode {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn new_shard(&self, kbid: &str) -> atlaskb::Result<String> {
        self.inner.new_shard(kbid).await
    }

    async fn delete_shard(&self, shard_id: &str) -> atlaskb::Result<()> {
        self.inner.delete_shard(shard_id).await
    }

    async fn add_resource(&self, shard_id: &str, message: &IndexMessage) -> atlaskb::Result<OpStatus> {
        if self.fail_add_resource.load(Ordering::SeqCst) {
            return Err(AtlasError::Index("index node unavailable".into()));
        }
        self.inner.add_resource(shard_id, message).await
    }

    async fn delete_resource(&self, shard_id: &str, uuid: &str) -> atlaskb::Result<OpStatus> {
        self.inner.delete_resource(shard_id, uuid).await
    }

    async fn list_shards(&self) -> atlaskb::Result<Vec<String>> {
        self.inner.list_shards().await
    }

    async fn get_shard(&self, shard_id: &str) -> atlaskb::Result<ShardInfo> {
        self.inner.get_shard(shard_id).await
    }
}

struct Harness {
    driver: Arc<dyn Driver>,
    node: Arc<FlakyNode>,
    audit: Arc<MemoryAuditSink>,
    deadletter: Arc<MemoryDeadletterStore>,
    notifications: broadcast::Receiver<Published>,
    processor: Processor,
}

impl Harness {
    fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut received = Vec::new();
        while let Ok(published) = self.notifications.try_recv() {
            assert_eq!(published.channel, format!("notify.{}", KBID));
            received.push(Notification::decode(&published.payload).unwrap());
        }
        received
    }

    async fn resource(&self, uuid: &str) -> Option<Resource> {
        let mut txn = self.driver.begin(true).await.unwrap();
        KnowledgeBox::new(KBID).get(txn.as_mut(), uuid).await.unwrap()
    }

    async fn resource_shard(&self, uuid: &str) -> Option<String> {
        let mut txn = self.driver.begin(true).await.unwrap();
        KnowledgeBox::new(KBID).get_resource_shard_id(txn.as_mut(), uuid).await.unwrap()
    }

    /// The indexed copy of `uuid` on its assigned shard
    async fn indexed(&self, uuid: &str) -> Option<atlaskb::shard::IndexedDocument> {
        let shard_id = self.resource_shard(uuid).await?;
        let mut txn = self.driver.begin(true).await.unwrap();
        let shards = ShardManager::get_shards(txn.as_mut(), KBID).await.unwrap()?;
        let replica = shards.find(&shard_id)?.replicas[0].clone();
        self.node.inner.document(&replica.shard_id, uuid).await.unwrap()
    }
}

async fn setup_harness(config: Config) -> Harness {
    let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
    let node = Arc::new(FlakyNode {
        inner: LocalIndexNode::new("node-0", 4).unwrap(),
        fail_add_resource: AtomicBool::new(false),
    });
    let shards = Arc::new(ShardManager::new(
        Arc::clone(&driver),
        vec![Arc::clone(&node) as Arc<dyn IndexNode>],
        &config,
    ));
    let pubsub = Arc::new(LocalPubSub::new(64));
    let notifications = pubsub.subscribe();
    let audit = Arc::new(MemoryAuditSink::new());
    let deadletter = Arc::new(MemoryDeadletterStore::new());

    let processor = Processor::new(
        Arc::clone(&driver),
        shards,
        pubsub,
        Arc::clone(&audit) as Arc<dyn AuditSink>,
        Arc::clone(&deadletter) as Arc<dyn DeadletterStore>,
        config,
    );
    processor
        .create_kb("docs", KnowledgeBoxConfig::default(), Some(KBID.to_string()))
        .await
        .unwrap();

    Harness { driver, node, audit, deadletter, notifications, processor }
}

fn default_config() -> Config {
    Config::builder().lock_acquire_timeout_ms(500).build()
}

fn body() -> FieldId {
    FieldId::new(FieldType::Text, "body")
}

/// Writer message setting the title and one text field
fn writer(uuid: &str, title: &str, text: &str) -> BrokerMessage {
    let mut message = BrokerMessage::new(KBID, uuid, MessageType::Autocommit);
    message.basic = Some(Basic { title: title.into(), ..Default::default() });
    message.texts.insert("body".into(), FieldValue::text(text));
    message
}

/// Processor message with extracted text for `fields`
fn extracted(uuid: &str, fields: &[&str]) -> BrokerMessage {
    let mut message = BrokerMessage::new(KBID, uuid, MessageType::Autocommit);
    message.source = MessageSource::Processor;
    for field in fields {
        message.extracted_text.push(ExtractedTextWrapper {
            field: FieldId::new(FieldType::Text, *field),
            body: ExtractedText { text: format!("extracted {}", field), ..Default::default() },
        });
    }
    message
}

/// Attach computed metadata for the body field to a processor message
fn with_body_metadata(mut message: BrokerMessage, metadata: FieldMetadata) -> BrokerMessage {
    message.field_metadata.push(FieldMetadataWrapper {
        field: body(),
        metadata: FieldComputedMetadata { metadata, ..Default::default() },
    });
    message
}

fn of_type(mut message: BrokerMessage, message_type: MessageType, multiid: &str) -> BrokerMessage {
    message.message_type = message_type;
    message.multiid = multiid.to_string();
    message
}

// =============================================================================
// Sequencing Tests
// =============================================================================

#[tokio::test]
async fn test_autocommit_creates_resource() {
    let mut h = setup_harness(default_config()).await;

    assert!(h.processor.process(writer("r1", "T", "hello"), 1, PARTITION).await.unwrap());

    let resource = h.resource("r1").await.unwrap();
    assert_eq!(resource.basic().title, "T");
    assert_eq!(resource.basic().last_seqid, 1);
    assert!(resource.has_field(&body()));
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(1));
    assert!(h.indexed("r1").await.is_some());

    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].action, NotificationAction::Commit);
    assert_eq!(notifications[0].write_type, Some(WriteType::Created));
    assert_eq!(notifications[0].seqid, 1);

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Created);
}

#[tokio::test]
async fn test_replayed_seqid_is_skipped() {
    let mut h = setup_harness(default_config()).await;

    assert!(h.processor.process(writer("r1", "first", "a"), 5, PARTITION).await.unwrap());
    assert!(!h.processor.process(writer("r1", "again", "b"), 5, PARTITION).await.unwrap());
    assert!(!h.processor.process(writer("r1", "older", "c"), 3, PARTITION).await.unwrap());

    assert_eq!(h.resource("r1").await.unwrap().basic().title, "first");
    assert_eq!(h.audit.events().len(), 1);
    assert_eq!(h.drain_notifications().len(), 1);
}

#[tokio::test]
async fn test_partitions_are_independent() {
    let h = setup_harness(default_config()).await;

    assert!(h.processor.process(writer("r1", "T", "a"), 10, "0").await.unwrap());
    assert!(h.processor.process(writer("r2", "T", "b"), 1, "1").await.unwrap());

    assert_eq!(h.processor.last_seqid("0").await.unwrap(), Some(10));
    assert_eq!(h.processor.last_seqid("1").await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_sync_seqid_skips_bookkeeping() {
    let h = setup_harness(default_config()).await;

    assert!(h.processor.process(writer("r1", "T", "a"), SYNC_SEQID, PARTITION).await.unwrap());
    assert!(h.processor.process(writer("r1", "T2", "a"), SYNC_SEQID, PARTITION).await.unwrap());

    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), None);
    let resource = h.resource("r1").await.unwrap();
    assert_eq!(resource.basic().title, "T2");
    assert_eq!(resource.basic().last_seqid, 0);
}

#[tokio::test]
async fn test_unmodified_batch_notifies_abort() {
    let mut h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.drain_notifications();

    let empty = BrokerMessage::new(KBID, "r1", MessageType::Autocommit);
    assert!(h.processor.process(empty, 2, PARTITION).await.unwrap());

    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].action, NotificationAction::Abort);
    assert_eq!(h.audit.events()[1].outcome, AuditOutcome::Unmodified);
}

// =============================================================================
// Skip Tests
// =============================================================================

#[tokio::test]
async fn test_message_for_deleted_kb_is_skipped() {
    let h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.processor.delete_kb(KBID).await.unwrap();

    assert!(h.processor.process(writer("r2", "T", "b"), 2, PARTITION).await.unwrap());

    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
    assert!(h.resource("r2").await.is_none());
    assert_eq!(h.audit.events()[1].outcome, AuditOutcome::Skipped);
    assert!(h.node.list_shards().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_secondary_message_for_missing_resource_is_skipped() {
    let h = setup_harness(default_config()).await;

    assert!(h.processor.process(extracted("ghost", &["body"]), 1, PARTITION).await.unwrap());
    let mut continuation = writer("ghost", "T", "a");
    continuation.txseqid = 3;
    assert!(h.processor.process(continuation, 2, PARTITION).await.unwrap());

    assert!(h.resource("ghost").await.is_none());
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
    assert!(h.audit.events().iter().all(|e| e.outcome == AuditOutcome::Skipped));
}

// =============================================================================
// Resource Resolution Tests
// =============================================================================

#[tokio::test]
async fn test_slug_resolves_existing_resource() {
    let h = setup_harness(default_config()).await;

    let mut create = writer("", "T", "a");
    create.slug = "my-doc".into();
    h.processor.process(create, 1, PARTITION).await.unwrap();
    let uuid = h.processor.get_kb_by_slug("docs").await.unwrap();
    assert_eq!(uuid.as_deref(), Some(KBID));

    let mut txn = h.driver.begin(true).await.unwrap();
    let rid = KnowledgeBox::new(KBID)
        .get_resource_uuid_by_slug(txn.as_mut(), "my-doc")
        .await
        .unwrap()
        .unwrap();
    drop(txn);
    assert_eq!(rid.len(), 32);

    let mut update = writer("", "Renamed", "b");
    update.slug = "my-doc".into();
    h.processor.process(update, 2, PARTITION).await.unwrap();

    let resource = h.resource(&rid).await.unwrap();
    assert_eq!(resource.basic().title, "Renamed");
    assert_eq!(resource.slug(), "my-doc");
}

#[tokio::test]
async fn test_repair_slug() {
    let h = setup_harness(default_config()).await;
    let mut create = writer("r1", "T", "a");
    create.slug = "doc".into();
    h.processor.process(create, 1, PARTITION).await.unwrap();

    // Lose the mapping as if the slug commit had failed
    let mut txn = h.driver.begin(false).await.unwrap();
    txn.delete(&keys::resource_slug(KBID, "doc")).await.unwrap();
    txn.commit().await.unwrap();

    assert!(h.processor.repair_slug(KBID, "r1").await.unwrap());
    assert!(!h.processor.repair_slug(KBID, "r1").await.unwrap());

    let mut txn = h.driver.begin(true).await.unwrap();
    let owner = KnowledgeBox::new(KBID).get_resource_uuid_by_slug(txn.as_mut(), "doc").await.unwrap();
    assert_eq!(owner.as_deref(), Some("r1"));

    let missing = h.processor.repair_slug(KBID, "nope").await;
    assert!(matches!(missing, Err(AtlasError::ResourceNotFound(_))));
}

// =============================================================================
// Delete Tests
// =============================================================================

#[tokio::test]
async fn test_delete_removes_resource_and_index() {
    let mut h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    let shard_id = h.resource_shard("r1").await.unwrap();
    h.drain_notifications();

    let delete = BrokerMessage::new(KBID, "r1", MessageType::Delete);
    assert!(h.processor.process(delete, 2, PARTITION).await.unwrap());

    assert!(h.resource("r1").await.is_none());
    assert!(h.resource_shard("r1").await.is_none());
    let mut txn = h.driver.begin(true).await.unwrap();
    let shards = ShardManager::get_shards(txn.as_mut(), KBID).await.unwrap().unwrap();
    let replica = &shards.find(&shard_id).unwrap().replicas[0];
    assert!(h.node.inner.document(&replica.shard_id, "r1").await.unwrap().is_none());

    let notifications = h.drain_notifications();
    assert_eq!(notifications[0].write_type, Some(WriteType::Deleted));
    assert_eq!(h.audit.events()[1].outcome, AuditOutcome::Deleted);
}

#[tokio::test]
async fn test_delete_missing_resource_advances_seqid() {
    let h = setup_harness(default_config()).await;

    let delete = BrokerMessage::new(KBID, "nope", MessageType::Delete);
    assert!(h.processor.process(delete, 4, PARTITION).await.unwrap());

    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(4));
    assert_eq!(h.audit.events()[0].outcome, AuditOutcome::Skipped);
}

#[tokio::test]
async fn test_delete_without_basic_record_clears_index() {
    let mut h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    let shard_id = h.resource_shard("r1").await.unwrap();
    h.drain_notifications();

    let mut txn = h.driver.begin(false).await.unwrap();
    txn.delete(&keys::resource_basic(KBID, "r1")).await.unwrap();
    txn.commit().await.unwrap();
    assert!(h.resource("r1").await.is_none());

    let delete = BrokerMessage::new(KBID, "r1", MessageType::Delete);
    assert!(h.processor.process(delete, 2, PARTITION).await.unwrap());

    assert!(h.resource_shard("r1").await.is_none());
    let mut txn = h.driver.begin(true).await.unwrap();
    let shards = ShardManager::get_shards(txn.as_mut(), KBID).await.unwrap().unwrap();
    let replica = &shards.find(&shard_id).unwrap().replicas[0];
    assert!(h.node.inner.document(&replica.shard_id, "r1").await.unwrap().is_none());
    assert_eq!(h.drain_notifications()[0].write_type, Some(WriteType::Deleted));
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
}

// =============================================================================
// MULTI Protocol Tests
// =============================================================================

#[tokio::test]
async fn test_multi_commit_applies_one_batch() {
    let mut h = setup_harness(default_config()).await;

    let first = of_type(writer("r1", "T", "a"), MessageType::Multi, "m1");
    let mut second = of_type(BrokerMessage::new(KBID, "r1", MessageType::Multi), MessageType::Multi, "m1");
    second.texts.insert("notes".into(), FieldValue::text("b"));
    let commit = of_type(BrokerMessage::new(KBID, "r1", MessageType::Commit), MessageType::Commit, "m1");

    assert!(h.processor.process(first, 1, PARTITION).await.unwrap());
    assert!(h.processor.process(second, 2, PARTITION).await.unwrap());
    assert_eq!(h.processor.pending_multi(), vec!["m1".to_string()]);
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
    assert!(h.resource("r1").await.is_none());

    assert!(h.processor.process(commit, 3, PARTITION).await.unwrap());

    let resource = h.resource("r1").await.unwrap();
    assert!(resource.has_field(&body()));
    assert!(resource.has_field(&FieldId::new(FieldType::Text, "notes")));
    assert_eq!(resource.basic().last_seqid, 3);
    assert!(h.processor.pending_multi().is_empty());

    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].seqid, 1);
    assert_eq!(notifications[0].multi, "m1");

    let outcomes: Vec<AuditOutcome> = h.audit.events().iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec![AuditOutcome::Buffered, AuditOutcome::Buffered, AuditOutcome::Created]);
}

#[tokio::test]
async fn test_rollback_drops_buffer() {
    let mut h = setup_harness(default_config()).await;

    let first = of_type(writer("r1", "T", "a"), MessageType::Multi, "m1");
    let rollback = of_type(BrokerMessage::new(KBID, "r1", MessageType::Rollback), MessageType::Rollback, "m1");
    h.processor.process(first, 1, PARTITION).await.unwrap();
    assert!(h.processor.process(rollback, 2, PARTITION).await.unwrap());

    assert!(h.resource("r1").await.is_none());
    assert!(h.processor.pending_multi().is_empty());
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].action, NotificationAction::Abort);
    assert_eq!(h.audit.events()[1].outcome, AuditOutcome::RolledBack);
}

#[tokio::test]
async fn test_commit_without_multi_is_deadlettered() {
    let mut h = setup_harness(default_config()).await;

    let commit = of_type(BrokerMessage::new(KBID, "r1", MessageType::Commit), MessageType::Commit, "m9");
    assert!(h.processor.process(commit, 1, PARTITION).await.unwrap());

    let entries = h.deadletter.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].seqid, 1);
    assert_eq!(h.drain_notifications()[0].action, NotificationAction::Abort);
    assert_eq!(h.audit.events()[0].outcome, AuditOutcome::Failed);
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_rollback_without_multi_is_deadlettered() {
    let mut h = setup_harness(default_config()).await;

    let rollback = of_type(BrokerMessage::new(KBID, "r1", MessageType::Rollback), MessageType::Rollback, "m9");
    assert!(h.processor.process(rollback, 1, PARTITION).await.unwrap());

    assert_eq!(h.deadletter.entries().len(), 1);
    assert_eq!(h.drain_notifications()[0].action, NotificationAction::Abort);
    assert_eq!(h.audit.events()[0].outcome, AuditOutcome::Failed);
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_stale_multi_is_swept() {
    let h = setup_harness(default_config()).await;

    let first = of_type(writer("r1", "T", "a"), MessageType::Multi, "m1");
    h.processor.process(first, 1, PARTITION).await.unwrap();
    assert_eq!(h.processor.sweep_multi(Duration::from_secs(60)), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.processor.sweep_multi(Duration::from_millis(10)), 1);
    assert!(h.processor.pending_multi().is_empty());

    let commit = of_type(BrokerMessage::new(KBID, "r1", MessageType::Commit), MessageType::Commit, "m1");
    h.processor.process(commit, 2, PARTITION).await.unwrap();
    assert!(h.resource("r1").await.is_none());
    assert_eq!(h.deadletter.entries().len(), 1);
}

#[tokio::test]
async fn test_configured_max_age_sweeps_on_process() {
    let config = Config::builder().lock_acquire_timeout_ms(500).multi_max_age_ms(10).build();
    let h = setup_harness(config).await;

    let first = of_type(writer("r1", "T", "a"), MessageType::Multi, "m1");
    h.processor.process(first, 1, PARTITION).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.processor.process(writer("r2", "T", "b"), 2, PARTITION).await.unwrap();
    assert!(h.processor.pending_multi().is_empty());
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
async fn test_index_failure_deadletters_and_marks_error() {
    let mut h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.drain_notifications();

    h.node.fail_add_resource.store(true, Ordering::SeqCst);
    let err = h.processor.process(writer("r1", "Changed", "b"), 2, PARTITION).await.unwrap_err();
    match err {
        AtlasError::Deadlettered { partition, seqid, source } => {
            assert_eq!(partition, PARTITION);
            assert_eq!(seqid, 2);
            assert!(matches!(*source, AtlasError::Index(_)));
        }
        other => panic!("expected Deadlettered, got {:?}", other),
    }

    // Nothing of the batch was committed
    let resource = h.resource("r1").await.unwrap();
    assert_eq!(resource.basic().title, "T");
    assert_eq!(resource.basic().status(), ResourceStatus::Error);
    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(1));

    let entries = h.deadletter.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.basic.as_ref().unwrap().title, "Changed");
    assert_eq!(h.drain_notifications()[0].action, NotificationAction::Abort);
    assert_eq!(h.audit.events()[1].outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn test_sync_failure_returns_raw_error() {
    let h = setup_harness(default_config()).await;
    h.node.fail_add_resource.store(true, Ordering::SeqCst);

    let err = h.processor.process(writer("r1", "T", "a"), SYNC_SEQID, PARTITION).await.unwrap_err();
    assert!(matches!(err, AtlasError::Index(_)));
    assert_eq!(h.deadletter.entries().len(), 1);
    assert!(h.resource("r1").await.is_none());
}

#[tokio::test]
async fn test_audit_reported_once_per_message() {
    let h = setup_harness(default_config()).await;

    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.processor.process(extracted("r1", &["body"]), 2, PARTITION).await.unwrap();
    h.node.fail_add_resource.store(true, Ordering::SeqCst);
    let _ = h.processor.process(writer("r1", "X", "b"), 3, PARTITION).await;
    h.node.fail_add_resource.store(false, Ordering::SeqCst);
    h.processor.process(BrokerMessage::new(KBID, "r1", MessageType::Delete), 4, PARTITION).await.unwrap();

    let events = h.audit.events();
    let seqids: Vec<i64> = events.iter().map(|e| e.seqid).collect();
    assert_eq!(seqids, vec![1, 2, 3, 4]);
    assert_eq!(events[1].source, MessageSource::Processor);
    assert_eq!(events[1].outcome, AuditOutcome::Modified);
}

// =============================================================================
// Index Limit Tests
// =============================================================================

#[tokio::test]
async fn test_not_indexable_resource_is_stored_with_error() {
    let config = Config::builder().lock_acquire_timeout_ms(500).max_resource_paragraphs(1).build();
    let mut h = setup_harness(config).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.drain_notifications();

    let metadata = FieldMetadata {
        paragraphs: vec![
            Paragraph { start: 0, end: 9, ..Default::default() },
            Paragraph { start: 10, end: 14, ..Default::default() },
        ],
        ..Default::default()
    };
    let message = with_body_metadata(extracted("r1", &["body"]), metadata);
    assert!(h.processor.process(message.clone(), 2, PARTITION).await.unwrap());

    assert_eq!(h.processor.last_seqid(PARTITION).await.unwrap(), Some(2));
    assert!(h.deadletter.entries().is_empty());
    assert_eq!(h.drain_notifications()[0].action, NotificationAction::Commit);

    let resource = h.resource("r1").await.unwrap();
    assert_eq!(resource.basic().status(), ResourceStatus::Error);
    let mut txn = h.driver.begin(true).await.unwrap();
    let text = resource.get_extracted_text(txn.as_mut(), &body()).await.unwrap().unwrap();
    assert_eq!(text.text, "extracted body");
    let errors = resource.get_field_errors(txn.as_mut(), &body()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, ErrorSeverity::Error);
    assert!(errors[0].error.contains("paragraphs"));
    drop(txn);

    // Redelivery is a replay, not another failure
    assert!(!h.processor.process(message, 2, PARTITION).await.unwrap());
    assert!(h.deadletter.entries().is_empty());
}

#[tokio::test]
async fn test_trimmed_entity_facets_are_stored_as_warnings() {
    let config = Config::builder().lock_acquire_timeout_ms(500).max_entity_facets(1).build();
    let h = setup_harness(config).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();

    let metadata = FieldMetadata {
        entities: vec![
            Entity { text: "Paris".into(), label: "PLACE".into() },
            Entity { text: "Rome".into(), label: "PLACE".into() },
        ],
        ..Default::default()
    };
    let message = with_body_metadata(extracted("r1", &["body"]), metadata);
    assert!(h.processor.process(message, 2, PARTITION).await.unwrap());

    let document = h.indexed("r1").await.unwrap();
    let facets = document.texts["t/body"].labels.iter().filter(|l| l.starts_with("/e/")).count();
    assert_eq!(facets, 1);

    let resource = h.resource("r1").await.unwrap();
    assert_eq!(resource.basic().status(), ResourceStatus::Processed);
    let mut txn = h.driver.begin(true).await.unwrap();
    let errors = resource.get_field_errors(txn.as_mut(), &body()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, ErrorSeverity::Warning);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[tokio::test]
async fn test_kb_config_updated_elsewhere_is_seen() {
    let h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();

    // Another process adds a vectorset behind this processor's cache
    let mut txn = h.driver.begin(false).await.unwrap();
    let mut config = KnowledgeBox::get_config(txn.as_mut(), KBID).await.unwrap().unwrap();
    config.vectorsets.push(VectorSetConfig { vectorset_id: "en".into(), vector_dimension: None });
    KnowledgeBox::update(txn.as_mut(), KBID, None, config).await.unwrap();
    txn.commit().await.unwrap();

    let mut message = extracted("r1", &["body"]);
    message.field_vectors.push(ExtractedVectorsWrapper {
        field: body(),
        vectorset_id: "en".into(),
        vectors: VectorObject {
            vectors: vec![Vector { start: 0, end: 9, start_paragraph: 0, end_paragraph: 9, vector: vec![1.0, 2.0] }],
            ..Default::default()
        },
    });
    assert!(h.processor.process(message, 2, PARTITION).await.unwrap());

    let resource = h.resource("r1").await.unwrap();
    let mut txn = h.driver.begin(true).await.unwrap();
    assert!(resource.get_vectors(txn.as_mut(), &body(), "en").await.unwrap().is_some());
}

// =============================================================================
// Shard Tests
// =============================================================================

#[tokio::test]
async fn test_full_shard_rotates_for_new_resources() {
    let config = Config::builder().lock_acquire_timeout_ms(500).max_node_fields(1).build();
    let h = setup_harness(config).await;

    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.processor.process(extracted("r1", &["body", "notes"]), 2, PARTITION).await.unwrap();
    h.processor.process(writer("r2", "T", "b"), 3, PARTITION).await.unwrap();

    let first = h.resource_shard("r1").await.unwrap();
    let second = h.resource_shard("r2").await.unwrap();
    assert_ne!(first, second);

    let mut txn = h.driver.begin(true).await.unwrap();
    let shards = ShardManager::get_shards(txn.as_mut(), KBID).await.unwrap().unwrap();
    assert_eq!(shards.shards.len(), 2);
    assert_eq!(shards.active().unwrap().shard, second);
}

#[tokio::test]
async fn test_processor_text_reaches_index() {
    let h = setup_harness(default_config()).await;

    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.processor.process(extracted("r1", &["body"]), 2, PARTITION).await.unwrap();

    let document = h.indexed("r1").await.unwrap();
    assert_eq!(document.texts["t/body"].text, "extracted body");
    assert_eq!(h.resource("r1").await.unwrap().basic().status(), ResourceStatus::Processed);
}

#[tokio::test]
async fn test_reindex_after_forgetting_shards() {
    let h = setup_harness(default_config()).await;
    h.processor.process(writer("r1", "T", "a"), 1, PARTITION).await.unwrap();
    h.processor.process(extracted("r1", &["body"]), 2, PARTITION).await.unwrap();
    let before = h.resource_shard("r1").await.unwrap();

    let mut txn = h.driver.begin(false).await.unwrap();
    assert_eq!(ShardManager::forget_shards(txn.as_mut(), KBID).await.unwrap(), 1);
    txn.commit().await.unwrap();

    h.processor.reindex_resource(KBID, "r1").await.unwrap();
    assert_ne!(h.resource_shard("r1").await.unwrap(), before);
    assert_eq!(h.indexed("r1").await.unwrap().texts["t/body"].text, "extracted body");

    let missing = h.processor.reindex_resource(KBID, "nope").await;
    assert!(matches!(missing, Err(AtlasError::ResourceNotFound(_))));
}
