//! Object mapping over KV transactions
//!
//! `KnowledgeBox` and `Resource` read and write their records through a
//! caller-owned `&mut dyn Transaction`; neither holds a transaction itself,
//! so the caller decides when to commit or abort.

mod knowledgebox;
mod resource;

pub use knowledgebox::{KnowledgeBox, KnowledgeBoxConfig, VectorSetConfig};
pub use resource::Resource;
