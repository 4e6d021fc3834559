//! Broker messages: the unit of ingestion mutation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    Basic, ExtractedText, FieldComputedMetadata, FieldError, FieldId, FieldType, FieldValue,
    Origin, Security, VectorObject,
};

/// What the message asks the processor to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Autocommit,
    Multi,
    Commit,
    Rollback,
    Delete,
}

/// Where the message was produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSource {
    /// Direct user/API edits
    #[default]
    Writer,
    /// The extraction/enrichment pipeline
    Processor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTextWrapper {
    pub field: FieldId,
    pub body: ExtractedText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadataWrapper {
    pub field: FieldId,
    pub metadata: FieldComputedMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedVectorsWrapper {
    pub field: FieldId,
    /// Empty means "the KB's only vectorset"
    #[serde(default)]
    pub vectorset_id: String,
    pub vectors: VectorObject,
}

/// One mutation of one resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerMessage {
    pub kbid: String,
    pub uuid: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub source: MessageSource,
    pub multiid: String,
    /// Position of the message inside a processing run; `> 0` marks a
    /// secondary message that must not create the resource
    pub txseqid: i64,
    /// Prefilter-affecting metadata changed: reindex every field's text
    pub reindex: bool,

    pub basic: Option<Basic>,
    pub origin: Option<Origin>,
    pub security: Option<Security>,

    pub texts: BTreeMap<String, FieldValue>,
    pub links: BTreeMap<String, FieldValue>,
    pub files: BTreeMap<String, FieldValue>,
    pub conversations: BTreeMap<String, FieldValue>,
    pub datetimes: BTreeMap<String, FieldValue>,
    pub keywordsets: BTreeMap<String, FieldValue>,
    pub layouts: BTreeMap<String, FieldValue>,
    pub delete_fields: Vec<FieldId>,

    pub extracted_text: Vec<ExtractedTextWrapper>,
    pub field_metadata: Vec<FieldMetadataWrapper>,
    pub field_vectors: Vec<ExtractedVectorsWrapper>,
    pub errors: Vec<FieldError>,
}

impl BrokerMessage {
    pub fn new(kbid: impl Into<String>, uuid: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            kbid: kbid.into(),
            uuid: uuid.into(),
            message_type,
            ..Default::default()
        }
    }

    /// Every user field value carried by the message, with its id
    pub fn field_values(&self) -> impl Iterator<Item = (FieldId, &FieldValue)> {
        [
            (FieldType::Text, &self.texts),
            (FieldType::Link, &self.links),
            (FieldType::File, &self.files),
            (FieldType::Conversation, &self.conversations),
            (FieldType::Datetime, &self.datetimes),
            (FieldType::Keywordset, &self.keywordsets),
            (FieldType::Layout, &self.layouts),
        ]
        .into_iter()
        .flat_map(|(field_type, values)| {
            values.iter().map(move |(id, value)| (FieldId::new(field_type, id.clone()), value))
        })
    }

    /// Title/summary of a basic update, as the generic fields they index as
    pub fn generic_fields(&self) -> Vec<FieldId> {
        let mut fields = Vec::new();
        if let Some(basic) = &self.basic {
            if !basic.title.is_empty() {
                fields.push(FieldId::new(FieldType::Generic, "title"));
            }
            if !basic.summary.is_empty() {
                fields.push(FieldId::new(FieldType::Generic, "summary"));
            }
        }
        fields
    }

    /// Whether any user paragraph annotation is carried for `field`
    pub fn has_paragraph_annotations(&self, field: &FieldId) -> bool {
        self.basic
            .as_ref()
            .and_then(|b| b.user_field_metadata(field))
            .map(|m| !m.paragraphs.is_empty())
            .unwrap_or(false)
    }
}
