//! Error types for AtlasKB
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasKB operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // KV Errors
    // -------------------------------------------------------------------------
    /// Optimistic concurrency failure, or `insert` on an existing key
    #[error("Conflict on key: {0}")]
    Conflict(String),

    /// Transient store failure; safe to retry with backoff
    #[error("Retryable KV error: {0}")]
    Retryable(String),

    #[error("Transaction already closed")]
    TransactionClosed,

    #[error("Write attempted on a read-only transaction")]
    ReadOnlyTransaction,

    // -------------------------------------------------------------------------
    // Lock Errors
    // -------------------------------------------------------------------------
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    // -------------------------------------------------------------------------
    // Knowledge Box Errors
    // -------------------------------------------------------------------------
    #[error("Knowledge box not found: {0}")]
    KnowledgeBoxNotFound(String),

    #[error("Knowledge box already exists: {0}")]
    KnowledgeBoxConflict(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    // -------------------------------------------------------------------------
    // Shard / Index Errors
    // -------------------------------------------------------------------------
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("No index nodes available")]
    NoIndexNodes,

    #[error("Index error: {0}")]
    Index(String),

    // -------------------------------------------------------------------------
    // Message Errors
    // -------------------------------------------------------------------------
    #[error("Invalid broker message: {0}")]
    InvalidMessage(String),

    #[error("Resource {uuid} is not indexable: {reason}")]
    ResourceNotIndexable { uuid: String, field: String, reason: String },

    // -------------------------------------------------------------------------
    // Processing Errors
    // -------------------------------------------------------------------------
    /// A batch failed and was written to the deadletter store
    #[error("Deadlettered batch (partition {partition}, seqid {seqid}): {source}")]
    Deadlettered {
        partition: String,
        seqid: i64,
        #[source]
        source: Box<AtlasError>,
    },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Whether the backoff layer should try the operation again.
    ///
    /// Conflicts are not retryable here: the caller must restart its whole
    /// transaction (or, for locks, re-read the lock record).
    pub fn is_retryable(&self) -> bool {
        matches!(self, AtlasError::Retryable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AtlasError::Conflict(_))
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(err: bincode::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AtlasError {
    fn from(err: serde_json::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}
