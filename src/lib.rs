//! # AtlasKB
//!
//! The ingestion core of a knowledge-base search system:
//! - Exactly-once application of partitioned broker message streams
//! - MULTI/COMMIT/ROLLBACK batching over one KV transaction
//! - Shard routing with rotation at a field-count ceiling
//! - Incremental index message building per message source
//! - Deadlettering, commit/abort notifications and audit events
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │             Broker partitions (seqid-ordered)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ process(message, seqid, partition)
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      Processor                               │
//! │        (replay check, MULTI buffers, batch txn)              │
//! └───────┬──────────────────┬───────────────────┬──────────────┘
//!         │                  │                   │
//!         ▼                  ▼                   ▼
//!   ┌───────────┐    ┌──────────────┐    ┌──────────────┐
//!   │ orm + kv  │    │ IndexMessage │    │ ShardManager │
//!   │ (WAL, txn)│    │   Builder    │───►│ (IndexNode)  │
//!   └───────────┘    └──────────────┘    └──────────────┘
//!         │
//!         ▼
//!   notifications · audit · deadletter
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod wal;
pub mod kv;
pub mod keys;
pub mod lock;

pub mod model;
pub mod orm;
pub mod cache;
pub mod index;
pub mod shard;
pub mod processor;
pub mod migrator;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::Config;
pub use kv::{Driver, LocalDriver, RetryingDriver, Transaction};
pub use processor::{Processor, SkipReason, TxnOutcome, SYNC_SEQID};
pub use shard::{IndexNode, LocalIndexNode, ShardManager};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasKB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
