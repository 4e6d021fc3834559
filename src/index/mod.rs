//! Index Message Module
//!
//! Computes the per-resource payload ("brain") a shard indexes.
//!
//! ## Entry Paths
//!
//! | Path | Fields | Categories | Replace |
//! |------|--------|------------|---------|
//! | `for_writer_bm` | touched by the batch, or all on `reindex` | texts, paragraphs | `!resource_created` |
//! | `for_processor_bm` | touched by the batch | texts, paragraphs, vectors, relations | always |
//! | `full` | all | all | `reindex` |
//!
//! ## Per-Field Order
//! ```text
//!   extracted text ──► texts ──► paragraphs ──► vectors
//!                                                 (attach to paragraph keys)
//!   computed metadata ─────────► relations (last by convention)
//! ```

mod brain;
mod builder;
mod message;

pub use brain::{compute_paragraph_key, trim_entity_facets, validate_indexable};
pub use builder::{messages_source, IndexMessageBuilder};
pub use message::{
    IndexMessage, IndexMetadata, IndexParagraph, IndexParagraphs, IndexStatus, ParagraphPosition,
    ResourceId, TextInformation, VectorSentence, VectorSentences,
};
