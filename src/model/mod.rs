//! Data model
//!
//! Broker messages and the resource/field records they mutate. Every type
//! is serde-serializable: bincode for KV records, JSON for message files.

mod field;
mod message;
mod resource;

pub use field::{
    Classification, Entity, ErrorSeverity, ExtractedText, FieldComputedMetadata, FieldError, FieldId,
    FieldMetadata, FieldType, FieldValue, ConversationMessage, PagePosition, Paragraph,
    ParagraphKind, Vector, VectorObject,
};
pub use message::{
    BrokerMessage, ExtractedTextWrapper, ExtractedVectorsWrapper, FieldMetadataWrapper,
    MessageSource, MessageType,
};
pub use resource::{
    Basic, Metadata, Origin, ParagraphAnnotation, Relation, RelationNode, RelationType,
    NodeType, ResourceStatus, Security, UserFieldMetadata, UserMetadata,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
