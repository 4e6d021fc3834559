//! Tests for knowledge box administration
//!
//! These tests verify:
//! - Slug uniqueness on create and update
//! - Delete removes every record and every shard
//! - Create rolls the KB back when no shard can be created
//! - Config changes reach the processor through its cache

use std::sync::Arc;

use atlaskb::kv::{self, Driver, LocalDriver};
use atlaskb::model::{
    BrokerMessage, ExtractedVectorsWrapper, FieldId, FieldType, FieldValue, MessageSource, MessageType,
    Vector, VectorObject,
};
use atlaskb::orm::{KnowledgeBox, KnowledgeBoxConfig, VectorSetConfig};
use atlaskb::processor::{LocalPubSub, MemoryAuditSink, MemoryDeadletterStore};
use atlaskb::shard::IndexNode;
use atlaskb::{keys, AtlasError, Config, LocalIndexNode, Processor, ShardManager};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_processor(node_count: usize) -> (Arc<dyn Driver>, Vec<Arc<LocalIndexNode>>, Processor) {
    let config = Config::builder().lock_acquire_timeout_ms(500).build();
    let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
    let nodes: Vec<Arc<LocalIndexNode>> = (0..node_count)
        .map(|i| Arc::new(LocalIndexNode::new(format!("node-{}", i), 4).unwrap()))
        .collect();
    let shards = Arc::new(ShardManager::new(
        Arc::clone(&driver),
        nodes.iter().map(|n| Arc::clone(n) as Arc<dyn IndexNode>).collect(),
        &config,
    ));
    let processor = Processor::new(
        Arc::clone(&driver),
        shards,
        Arc::new(LocalPubSub::new(16)),
        Arc::new(MemoryAuditSink::new()),
        Arc::new(MemoryDeadletterStore::new()),
        config,
    );
    (driver, nodes, processor)
}

fn titled(title: &str) -> KnowledgeBoxConfig {
    KnowledgeBoxConfig { title: title.into(), ..Default::default() }
}

// =============================================================================
// ORM Tests
// =============================================================================

#[tokio::test]
async fn test_create_rejects_taken_slug() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    KnowledgeBox::create(txn.as_mut(), "docs", titled("a"), None).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = driver.begin(false).await.unwrap();
    let result = KnowledgeBox::create(txn.as_mut(), "docs", titled("b"), None).await;
    assert!(matches!(result, Err(AtlasError::KnowledgeBoxConflict(slug)) if slug == "docs"));
}

#[tokio::test]
async fn test_create_rejects_empty_slug() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    let result = KnowledgeBox::create(txn.as_mut(), "", titled("a"), None).await;
    assert!(matches!(result, Err(AtlasError::InvalidMessage(_))));
}

#[tokio::test]
async fn test_update_moves_slug() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    let kbid = KnowledgeBox::create(txn.as_mut(), "old", titled("a"), None).await.unwrap();
    KnowledgeBox::update(txn.as_mut(), &kbid, Some("new"), titled("b")).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = driver.begin(true).await.unwrap();
    assert!(KnowledgeBox::get_kbid_by_slug(txn.as_mut(), "old").await.unwrap().is_none());
    assert_eq!(KnowledgeBox::get_kbid_by_slug(txn.as_mut(), "new").await.unwrap(), Some(kbid.clone()));
    let config = KnowledgeBox::get_config(txn.as_mut(), &kbid).await.unwrap().unwrap();
    assert_eq!(config.slug, "new");
    assert_eq!(config.title, "b");
}

#[tokio::test]
async fn test_update_keeps_migration_version() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    let kbid = KnowledgeBox::create(
        txn.as_mut(),
        "docs",
        KnowledgeBoxConfig { migration_version: 4, ..Default::default() },
        None,
    )
    .await
    .unwrap();
    KnowledgeBox::update(txn.as_mut(), &kbid, None, titled("renamed")).await.unwrap();

    let config = KnowledgeBox::get_config(txn.as_mut(), &kbid).await.unwrap().unwrap();
    assert_eq!(config.migration_version, 4);
    assert_eq!(config.slug, "docs");
}

#[tokio::test]
async fn test_update_to_taken_slug_conflicts() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    KnowledgeBox::create(txn.as_mut(), "a", titled("a"), None).await.unwrap();
    let second = KnowledgeBox::create(txn.as_mut(), "b", titled("b"), None).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = driver.begin(false).await.unwrap();
    let result = KnowledgeBox::update(txn.as_mut(), &second, Some("a"), titled("b")).await;
    assert!(matches!(result, Err(AtlasError::KnowledgeBoxConflict(_))));
}

#[tokio::test]
async fn test_list_by_slug_prefix() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    for slug in ["team-a", "team-b", "other"] {
        KnowledgeBox::create(txn.as_mut(), slug, titled(slug), Some(format!("id-{}", slug))).await.unwrap();
    }
    txn.commit().await.unwrap();

    let mut txn = driver.begin(true).await.unwrap();
    let listed = KnowledgeBox::list(txn.as_mut(), "team-").await.unwrap();
    assert_eq!(
        listed,
        vec![
            ("team-a".to_string(), "id-team-a".to_string()),
            ("team-b".to_string(), "id-team-b".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_delete_removes_every_record() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    KnowledgeBox::create(txn.as_mut(), "docs", titled("a"), Some("kb1".into())).await.unwrap();
    KnowledgeBox::create(txn.as_mut(), "keep", titled("b"), Some("kb10".into())).await.unwrap();
    let kb = KnowledgeBox::new("kb1");
    kb.add_resource(txn.as_mut(), "r1", "doc", None).await.unwrap();
    kb.set_resource_slug(txn.as_mut(), "doc", "r1").await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = driver.begin(false).await.unwrap();
    let removed = KnowledgeBox::delete(txn.as_mut(), "kb1").await.unwrap();
    assert_eq!(removed.slug, "docs");
    txn.commit().await.unwrap();

    let mut txn = driver.begin(true).await.unwrap();
    assert!(kv::collect_keys(txn.as_mut(), &keys::kb_prefix("kb1"), None).await.unwrap().is_empty());
    assert!(KnowledgeBox::get_kbid_by_slug(txn.as_mut(), "docs").await.unwrap().is_none());
    assert!(KnowledgeBox::exists(txn.as_mut(), "kb10").await.unwrap());
}

#[tokio::test]
async fn test_delete_missing_kb() {
    let driver = LocalDriver::in_memory();
    let mut txn = driver.begin(false).await.unwrap();
    let result = KnowledgeBox::delete(txn.as_mut(), "nope").await;
    assert!(matches!(result, Err(AtlasError::KnowledgeBoxNotFound(_))));
}

// =============================================================================
// Processor Administration Tests
// =============================================================================

#[tokio::test]
async fn test_create_kb_creates_first_shard() {
    let (driver, nodes, processor) = setup_processor(1);

    let kbid = processor.create_kb("docs", titled("Docs"), None).await.unwrap();
    assert_eq!(processor.get_kb_by_slug("docs").await.unwrap(), Some(kbid.clone()));
    assert_eq!(processor.get_kb(&kbid).await.unwrap().unwrap().title, "Docs");
    assert_eq!(processor.list_kbs("").await.unwrap(), vec![("docs".to_string(), kbid.clone())]);

    let mut txn = driver.begin(true).await.unwrap();
    let shards = ShardManager::get_shards(txn.as_mut(), &kbid).await.unwrap().unwrap();
    assert_eq!(shards.shards.len(), 1);
    assert_eq!(nodes[0].list_shards().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_kb_without_nodes_is_rolled_back() {
    let (_driver, _nodes, processor) = setup_processor(0);

    let result = processor.create_kb("docs", titled("Docs"), Some("kb1".into())).await;
    assert!(matches!(result, Err(AtlasError::NoIndexNodes)));
    assert!(processor.get_kb("kb1").await.unwrap().is_none());
    assert!(processor.get_kb_by_slug("docs").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_kb_drops_shards() {
    let (_driver, nodes, processor) = setup_processor(2);
    let kbid = processor.create_kb("docs", titled("Docs"), None).await.unwrap();

    processor.delete_kb(&kbid).await.unwrap();

    assert!(processor.get_kb(&kbid).await.unwrap().is_none());
    for node in &nodes {
        assert!(node.list_shards().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_update_kb_reaches_processing() {
    let (driver, _nodes, processor) = setup_processor(1);
    let kbid = processor.create_kb("docs", titled("Docs"), None).await.unwrap();
    let field = FieldId::new(FieldType::Text, "body");

    let mut created = BrokerMessage::new(kbid.as_str(), "r1", MessageType::Autocommit);
    created.texts.insert("body".into(), FieldValue::text("hello"));
    processor.process(created, 1, "0").await.unwrap();

    let vectors = || {
        let mut message = BrokerMessage::new(kbid.as_str(), "r1", MessageType::Autocommit);
        message.source = MessageSource::Processor;
        message.field_vectors.push(ExtractedVectorsWrapper {
            field: field.clone(),
            vectorset_id: "v1".into(),
            vectors: VectorObject {
                vectors: vec![Vector { start: 0, end: 5, vector: vec![1.0, 2.0], ..Default::default() }],
                ..Default::default()
            },
        });
        message
    };

    // The cached config has no vectorsets yet
    processor.process(vectors(), 2, "0").await.unwrap();
    let mut txn = driver.begin(true).await.unwrap();
    let resource = KnowledgeBox::new(kbid.as_str()).get(txn.as_mut(), "r1").await.unwrap().unwrap();
    assert!(resource.get_vectors(txn.as_mut(), &field, "v1").await.unwrap().is_none());
    drop(txn);

    let mut config = processor.get_kb(&kbid).await.unwrap().unwrap();
    config.vectorsets.push(VectorSetConfig { vectorset_id: "v1".into(), vector_dimension: None });
    processor.update_kb(&kbid, None, config).await.unwrap();

    processor.process(vectors(), 3, "0").await.unwrap();
    let mut txn = driver.begin(true).await.unwrap();
    let resource = KnowledgeBox::new(kbid.as_str()).get(txn.as_mut(), "r1").await.unwrap().unwrap();
    assert!(resource.get_vectors(txn.as_mut(), &field, "v1").await.unwrap().is_some());
}
