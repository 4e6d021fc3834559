//! Tests for the shard manager
//!
//! These tests verify:
//! - Shard creation across index nodes, with replicas
//! - Rotation once the active shard is full
//! - Rollback of partially created shards
//! - Forgetting and deleting a KB's shards

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use atlaskb::index::{IndexMessage, TextInformation};
use atlaskb::kv::{Driver, LocalDriver};
use atlaskb::orm::KnowledgeBox;
use atlaskb::shard::{IndexNode, OpStatus, ShardInfo};
use atlaskb::{AtlasError, Config, LocalIndexNode, ShardManager};

// =============================================================================
// Helper Functions
// =============================================================================

/// Index node whose shard creation can be switched off
struct FlakyNode {
    inner: LocalIndexNode,
    fail_new_shard: AtomicBool,
}

impl FlakyNode {
    fn new(id: &str) -> Self {
        Self { inner: LocalIndexNode::new(id, 4).unwrap(), fail_new_shard: AtomicBool::new(false) }
    }
}

#[async_trait]
impl IndexNode for FlakyNode {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn new_shard(&self, kbid: &str) -> atlaskb::Result<String> {
        if self.fail_new_shard.load(Ordering::SeqCst) {
            return Err(AtlasError::Index("node refused new shard".into()));
        }
        self.inner.new_shard(kbid).await
    }

    async fn delete_shard(&self, shard_id: &str) -> atlaskb::Result<()> {
        self.inner.delete_shard(shard_id).await
    }

    async fn add_resource(&self, shard_id: &str, message: &IndexMessage) -> atlaskb::Result<OpStatus> {
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

fn setup_config(replicas: usize, max_node_fields: u64) -> Config {
    Config::builder()
        .shard_replicas(replicas)
        .max_node_fields(max_node_fields)
        .lock_acquire_timeout_ms(500)
        .build()
}

fn setup_manager(node_count: usize, config: &Config) -> (Arc<dyn Driver>, Vec<Arc<LocalIndexNode>>, ShardManager) {
    let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
    let nodes: Vec<Arc<LocalIndexNode>> = (0..node_count)
        .map(|i| Arc::new(LocalIndexNode::new(format!("node-{}", i), 4).unwrap()))
        .collect();
    let dyn_nodes = nodes.iter().map(|n| Arc::clone(n) as Arc<dyn IndexNode>).collect();
    let manager = ShardManager::new(Arc::clone(&driver), dyn_nodes, config);
    (driver, nodes, manager)
}

fn message_with_fields(uuid: &str, fields: usize) -> IndexMessage {
    let mut message = IndexMessage::new(uuid);
    for i in 0..fields {
        message
            .texts
            .insert(format!("t/field{}", i), TextInformation { text: format!("text {}", i), labels: vec![] });
    }
    message
}

async fn assign(driver: &Arc<dyn Driver>, manager: &ShardManager, kbid: &str, uuid: &str) -> String {
    let mut txn = driver.begin(false).await.unwrap();
    let shard = manager.get_or_assign_resource_shard(txn.as_mut(), kbid, uuid).await.unwrap();
    txn.commit().await.unwrap();
    shard.shard
}

// =============================================================================
// Creation Tests
// =============================================================================

#[tokio::test]
async fn test_create_shard_becomes_active() {
    let config = setup_config(1, 1_000);
    let (driver, nodes, manager) = setup_manager(1, &config);

    let shard = manager.create_shard_by_kbid("kb1").await.unwrap();
    assert_eq!(shard.replicas.len(), 1);
    assert_eq!(shard.replicas[0].node, "node-0");
    assert_eq!(nodes[0].list_shards().await.unwrap(), vec![shard.replicas[0].shard_id.clone()]);

    let mut txn = driver.begin(true).await.unwrap();
    let active = ShardManager::get_current_active_shard(txn.as_mut(), "kb1").await.unwrap().unwrap();
    assert_eq!(active, shard);
}

#[tokio::test]
async fn test_replicas_land_on_distinct_nodes() {
    let config = setup_config(2, 1_000);
    let (_driver, _nodes, manager) = setup_manager(3, &config);

    let shard = manager.create_shard_by_kbid("kb1").await.unwrap();
    assert_eq!(shard.replicas.len(), 2);
    assert_ne!(shard.replicas[0].node, shard.replicas[1].node);
}

#[tokio::test]
async fn test_new_shards_prefer_unused_nodes() {
    let config = setup_config(1, 1_000);
    let (driver, _nodes, manager) = setup_manager(2, &config);

    let first = manager.create_shard_by_kbid("kb1").await.unwrap();
    let second = manager.create_shard_by_kbid("kb1").await.unwrap();
    assert_ne!(first.replicas[0].node, second.replicas[0].node);

    let mut txn = driver.begin(true).await.unwrap();
    let shards = ShardManager::get_shards(txn.as_mut(), "kb1").await.unwrap().unwrap();
    assert_eq!(shards.shards.len(), 2);
    assert_eq!(shards.actual, 1);
}

#[tokio::test]
async fn test_not_enough_nodes() {
    let config = setup_config(3, 1_000);
    let (driver, _nodes, manager) = setup_manager(2, &config);

    let result = manager.create_shard_by_kbid("kb1").await;
    assert!(matches!(result, Err(AtlasError::NoIndexNodes)));

    let mut txn = driver.begin(true).await.unwrap();
    assert!(ShardManager::get_shards(txn.as_mut(), "kb1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_replica_rolls_back_created_ones() {
    let config = setup_config(2, 1_000);
    let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
    let healthy = Arc::new(FlakyNode::new("node-a"));
    let broken = Arc::new(FlakyNode::new("node-b"));
    broken.fail_new_shard.store(true, Ordering::SeqCst);
    let manager = ShardManager::new(
        Arc::clone(&driver),
        vec![Arc::clone(&healthy) as Arc<dyn IndexNode>, Arc::clone(&broken) as Arc<dyn IndexNode>],
        &config,
    );

    assert!(manager.create_shard_by_kbid("kb1").await.is_err());
    assert!(healthy.list_shards().await.unwrap().is_empty());

    let mut txn = driver.begin(true).await.unwrap();
    assert!(ShardManager::get_shards(txn.as_mut(), "kb1").await.unwrap().is_none());
}

// =============================================================================
// Assignment Tests
// =============================================================================

#[tokio::test]
async fn test_assignment_is_sticky() {
    let config = setup_config(1, 1_000);
    let (driver, _nodes, manager) = setup_manager(1, &config);

    let first = assign(&driver, &manager, "kb1", "r1").await;
    let again = assign(&driver, &manager, "kb1", "r1").await;
    assert_eq!(first, again);

    let mut txn = driver.begin(true).await.unwrap();
    let stored = KnowledgeBox::new("kb1").get_resource_shard_id(txn.as_mut(), "r1").await.unwrap();
    assert_eq!(stored, Some(first));
}

#[tokio::test]
async fn test_full_shard_rotates() {
    let config = setup_config(1, 2);
    let (driver, _nodes, manager) = setup_manager(1, &config);

    let first = assign(&driver, &manager, "kb1", "r1").await;
    let mut txn = driver.begin(true).await.unwrap();
    let shard = ShardManager::get_current_active_shard(txn.as_mut(), "kb1").await.unwrap().unwrap();
    drop(txn);

    let status = manager.add_resource(&shard, &message_with_fields("r1", 3)).await.unwrap();
    assert_eq!(status.fields, 3);
    assert!(manager.should_create_new_shard(&shard).await.unwrap());

    let second = assign(&driver, &manager, "kb1", "r2").await;
    assert_ne!(first, second);

    // r1 stays where it was
    assert_eq!(assign(&driver, &manager, "kb1", "r1").await, first);
}

#[tokio::test]
async fn test_shard_below_limit_is_reused() {
    let config = setup_config(1, 10);
    let (driver, _nodes, manager) = setup_manager(1, &config);

    let first = assign(&driver, &manager, "kb1", "r1").await;
    let second = assign(&driver, &manager, "kb1", "r2").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_add_resource_reaches_every_replica() {
    let config = setup_config(2, 1_000);
    let (_driver, nodes, manager) = setup_manager(2, &config);

    let shard = manager.create_shard_by_kbid("kb1").await.unwrap();
    manager.add_resource(&shard, &message_with_fields("r1", 1)).await.unwrap();

    for replica in &shard.replicas {
        let node = nodes.iter().find(|n| n.id() == replica.node).unwrap();
        let document = node.document(&replica.shard_id, "r1").await.unwrap().unwrap();
        assert_eq!(document.texts["t/field0"].text, "text 0");
    }

    manager.delete_resource(&shard, "r1").await.unwrap();
    let replica = &shard.replicas[0];
    let node = nodes.iter().find(|n| n.id() == replica.node).unwrap();
    assert!(node.document(&replica.shard_id, "r1").await.unwrap().is_none());
}

// =============================================================================
// Cleanup Tests
// =============================================================================

#[tokio::test]
async fn test_forget_shards_unassigns_resources() {
    let config = setup_config(1, 1_000);
    let (driver, _nodes, manager) = setup_manager(1, &config);

    let mut txn = driver.begin(false).await.unwrap();
    KnowledgeBox::create(txn.as_mut(), "docs", Default::default(), Some("kb1".into())).await.unwrap();
    KnowledgeBox::new("kb1").add_resource(txn.as_mut(), "r1", "", None).await.unwrap();
    txn.commit().await.unwrap();
    let first = assign(&driver, &manager, "kb1", "r1").await;

    let mut txn = driver.begin(false).await.unwrap();
    ShardManager::forget_shards(txn.as_mut(), "kb1").await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = driver.begin(true).await.unwrap();
    assert!(ShardManager::get_shards(txn.as_mut(), "kb1").await.unwrap().is_none());
    assert!(KnowledgeBox::new("kb1").get_resource_shard_id(txn.as_mut(), "r1").await.unwrap().is_none());
    drop(txn);

    assert_ne!(assign(&driver, &manager, "kb1", "r1").await, first);
}

#[tokio::test]
async fn test_delete_kb_shards_drops_replicas() {
    let config = setup_config(1, 1_000);
    let (driver, nodes, manager) = setup_manager(2, &config);

    manager.create_shard_by_kbid("kb1").await.unwrap();
    manager.create_shard_by_kbid("kb1").await.unwrap();

    let mut txn = driver.begin(true).await.unwrap();
    let shards = ShardManager::get_shards(txn.as_mut(), "kb1").await.unwrap().unwrap();
    drop(txn);

    manager.delete_kb_shards(&shards).await;
    for node in &nodes {
        assert!(node.list_shards().await.unwrap().is_empty());
    }
}
