//! Tests for the distributed lock
//!
//! These tests verify:
//! - Mutual exclusion and the `ResourceLocked` timeout
//! - Hand-over after release
//! - Lease refresh while held, takeover once expired
//! - Background release of dropped guards

use std::sync::Arc;
use std::time::Duration;

use atlaskb::kv::{Driver, LocalDriver};
use atlaskb::lock::{distributed_lock, is_locked, LockConfig};
use atlaskb::AtlasError;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_driver() -> Arc<dyn Driver> {
    Arc::new(LocalDriver::in_memory())
}

fn lock_config(lease_ms: u64, refresh_ms: u64, timeout_ms: u64) -> LockConfig {
    LockConfig {
        lease: Duration::from_millis(lease_ms),
        refresh_interval: Duration::from_millis(refresh_ms),
        acquire_timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(10),
    }
}

// =============================================================================
// Exclusion Tests
// =============================================================================

#[tokio::test]
async fn test_acquire_and_release() {
    let driver = setup_driver();
    let config = lock_config(5_000, 1_000, 200);

    let guard = distributed_lock(Arc::clone(&driver), "shard-creation-kb1", &config).await.unwrap();
    assert_eq!(guard.name(), "shard-creation-kb1");
    assert!(is_locked(driver.as_ref(), "shard-creation-kb1").await.unwrap());

    guard.release().await.unwrap();
    assert!(!is_locked(driver.as_ref(), "shard-creation-kb1").await.unwrap());
}

#[tokio::test]
async fn test_second_acquire_times_out() {
    let driver = setup_driver();
    let config = lock_config(5_000, 1_000, 100);

    let guard = distributed_lock(Arc::clone(&driver), "migration-kb1", &config).await.unwrap();
    let err = distributed_lock(Arc::clone(&driver), "migration-kb1", &config).await.err().unwrap();
    assert!(matches!(err, AtlasError::ResourceLocked(name) if name == "migration-kb1"));

    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_different_names_do_not_block() {
    let driver = setup_driver();
    let config = lock_config(5_000, 1_000, 100);

    let a = distributed_lock(Arc::clone(&driver), "shard-creation-a", &config).await.unwrap();
    let b = distributed_lock(Arc::clone(&driver), "shard-creation-b", &config).await.unwrap();
    a.release().await.unwrap();
    b.release().await.unwrap();
}

#[tokio::test]
async fn test_waiter_gets_lock_after_release() {
    let driver = setup_driver();
    let config = lock_config(5_000, 1_000, 2_000);

    let guard = distributed_lock(Arc::clone(&driver), "kb", &config).await.unwrap();
    let waiter = {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move { distributed_lock(driver, "kb", &config).await.map(|g| g.name().to_string()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    guard.release().await.unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), "kb");
}

// =============================================================================
// Lease Tests
// =============================================================================

#[tokio::test]
async fn test_refresh_keeps_lock_past_lease() {
    let driver = setup_driver();
    let config = lock_config(150, 40, 50);

    let guard = distributed_lock(Arc::clone(&driver), "kb", &config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(is_locked(driver.as_ref(), "kb").await.unwrap());
    assert!(distributed_lock(Arc::clone(&driver), "kb", &config).await.is_err());
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let driver = setup_driver();
    // Refresh far slower than the lease: the record expires while "held"
    let stale = lock_config(50, 10_000, 100);
    let _abandoned = distributed_lock(Arc::clone(&driver), "kb", &stale).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!is_locked(driver.as_ref(), "kb").await.unwrap());

    let fresh = lock_config(5_000, 1_000, 200);
    let guard = distributed_lock(Arc::clone(&driver), "kb", &fresh).await.unwrap();
    assert!(is_locked(driver.as_ref(), "kb").await.unwrap());
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_dropped_guard_is_released() {
    let driver = setup_driver();
    let config = lock_config(5_000, 1_000, 500);

    let guard = distributed_lock(Arc::clone(&driver), "kb", &config).await.unwrap();
    drop(guard);

    let guard = distributed_lock(Arc::clone(&driver), "kb", &config).await.unwrap();
    guard.release().await.unwrap();
}
