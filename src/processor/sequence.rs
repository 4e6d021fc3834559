//! Per-partition sequence bookkeeping

use crate::error::Result;
use crate::keys;
use crate::kv::{self, Transaction};

/// Sequence id of synchronous calls: no bookkeeping, errors surface unwrapped
pub const SYNC_SEQID: i64 = -1;

pub async fn get_last_seqid(txn: &mut dyn Transaction, partition: &str) -> Result<Option<i64>> {
    kv::get_record(txn, &keys::partition_last_seqid(partition)).await
}

pub async fn set_last_seqid(txn: &mut dyn Transaction, partition: &str, seqid: i64) -> Result<()> {
    kv::set_record(txn, &keys::partition_last_seqid(partition), &seqid).await
}

/// Whether `seqid` was applied already on `partition`
pub fn is_replay(last: Option<i64>, seqid: i64) -> bool {
    seqid != SYNC_SEQID && last.map(|last| seqid <= last).unwrap_or(false)
}
