//! Index message types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Relation, Security};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceId {
    pub uuid: String,
    pub shard_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub created: i64,
    pub modified: i64,
}

/// Status as the index sees it; only two values are exposed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexStatus {
    #[default]
    Pending,
    Processed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextInformation {
    pub text: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParagraphPosition {
    pub index: u64,
    pub start: u32,
    pub end: u32,
    pub page_number: u64,
    pub in_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorSentence {
    pub vector: Vec<f32>,
    pub position: ParagraphPosition,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorSentences {
    pub sentences: BTreeMap<String, VectorSentence>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexParagraph {
    pub start: u32,
    pub end: u32,
    pub labels: Vec<String>,
    pub field: String,
    pub split: String,
    pub index: u64,
    pub repeated_in_field: bool,
    pub position: ParagraphPosition,
    /// vectorset id → sentences
    pub vectorsets_sentences: BTreeMap<String, VectorSentences>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexParagraphs {
    pub paragraphs: BTreeMap<String, IndexParagraph>,
}

/// Everything a shard needs to (re)index one resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMessage {
    pub resource: ResourceId,
    pub metadata: IndexMetadata,
    pub status: IndexStatus,
    pub labels: Vec<String>,
    pub security: Option<Security>,

    /// field key → text
    pub texts: BTreeMap<String, TextInformation>,
    /// field key → paragraphs
    pub paragraphs: BTreeMap<String, IndexParagraphs>,
    /// field key → relations
    pub field_relations: BTreeMap<String, Vec<Relation>>,

    /// Full field ids whose texts must be dropped first
    pub texts_to_delete: Vec<String>,
    pub paragraphs_to_delete: Vec<String>,
    pub sentences_to_delete: Vec<String>,
    /// Field keys whose relations must be dropped first
    pub relation_fields_to_delete: Vec<String>,
    /// vectorset id → full field ids
    pub vector_prefixes_to_delete: BTreeMap<String, Vec<String>>,

    /// Texts were computed only to feed paragraphs
    pub skip_texts: Option<bool>,
    /// Paragraphs were computed only to feed vectors
    pub skip_paragraphs: Option<bool>,
}

impl IndexMessage {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            resource: ResourceId { uuid: uuid.into(), shard_id: String::new() },
            ..Default::default()
        }
    }

    pub fn uuid(&self) -> &str {
        &self.resource.uuid
    }

    pub fn paragraph_count(&self) -> usize {
        self.paragraphs.values().map(|p| p.paragraphs.len()).sum()
    }

    pub fn sentence_count(&self) -> usize {
        self.paragraphs
            .values()
            .flat_map(|p| p.paragraphs.values())
            .flat_map(|p| p.vectorsets_sentences.values())
            .map(|s| s.sentences.len())
            .sum()
    }

    pub fn set_security(&mut self, security: Option<&Security>) {
        self.security = security.cloned();
    }
}
