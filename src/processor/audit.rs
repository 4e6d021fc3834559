//! Audit reporting
//!
//! Every `process` call past the sequence check reports exactly one event.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{now_secs, MessageSource, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Created,
    Modified,
    Deleted,
    /// MULTI part held until its COMMIT
    Buffered,
    RolledBack,
    Unmodified,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kbid: String,
    pub uuid: String,
    pub partition: String,
    pub seqid: i64,
    pub message_type: MessageType,
    pub source: MessageSource,
    pub outcome: AuditOutcome,
    pub timestamp: i64,
}

impl AuditEvent {
    pub fn new(
        kbid: impl Into<String>,
        uuid: impl Into<String>,
        partition: impl Into<String>,
        seqid: i64,
        message_type: MessageType,
        source: MessageSource,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            kbid: kbid.into(),
            uuid: uuid.into(),
            partition: partition.into(),
            seqid,
            message_type,
            source,
            outcome,
            timestamp: now_secs(),
        }
    }
}

/// Receives audit events; reporting never fails the caller
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn report(&self, event: AuditEvent);
}

/// Writes events to the `atlaskb::audit` tracing target
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn report(&self, event: AuditEvent) {
        info!(
            target: "atlaskb::audit",
            kbid = %event.kbid,
            uuid = %event.uuid,
            partition = %event.partition,
            seqid = event.seqid,
            kind = ?event.message_type,
            outcome = ?event.outcome,
            "audit"
        );
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn report(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
