//! Write-Ahead Log (WAL) Module
//!
//! Durability for the local KV driver. Every committed transaction is
//! appended as one entry before it becomes visible to readers; `open`
//! replays the log on top of the last snapshot.
//!
//! ## Entry framing
//! ```text
//! ┌─────────┬─────────┬─────────┬──────────────────────────────┐
//! │ LSN (8) │ CRC (4) │ Len (4) │ bincode(operations, ts_ms)   │
//! └─────────┴─────────┴─────────┴──────────────────────────────┘
//! ```
//!
//! The CRC covers the body only. A short or mismatching tail is treated as
//! a torn write and truncated during recovery.

mod entry;
mod writer;
mod reader;
mod recovery;

pub use entry::{Operation, WalEntry, HEADER_SIZE};
pub use reader::WalReader;
pub use recovery::{RecoveryResult, WalRecovery};
pub use writer::WalWriter;
