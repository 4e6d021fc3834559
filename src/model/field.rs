//! Fields and their extracted artifacts

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of field kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Text,
    File,
    Link,
    Conversation,
    Datetime,
    Keywordset,
    Layout,
    Generic,
}

impl FieldType {
    pub const ALL: [FieldType; 8] = [
        FieldType::Text,
        FieldType::File,
        FieldType::Link,
        FieldType::Conversation,
        FieldType::Datetime,
        FieldType::Keywordset,
        FieldType::Layout,
        FieldType::Generic,
    ];

    /// One-letter form used in keys and index ids
    pub fn abbrev(self) -> &'static str {
        match self {
            FieldType::Text => "t",
            FieldType::File => "f",
            FieldType::Link => "u",
            FieldType::Conversation => "c",
            FieldType::Datetime => "d",
            FieldType::Keywordset => "k",
            FieldType::Layout => "l",
            FieldType::Generic => "a",
        }
    }

    pub fn from_abbrev(abbrev: &str) -> Option<Self> {
        FieldType::ALL.into_iter().find(|t| t.abbrev() == abbrev)
    }
}

/// A field within a resource: `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId {
    pub field_type: FieldType,
    pub field: String,
}

impl FieldId {
    pub fn new(field_type: FieldType, field: impl Into<String>) -> Self {
        Self { field_type, field: field.into() }
    }

    /// `"{type}/{id}"`
    pub fn key(&self) -> String {
        format!("{}/{}", self.field_type.abbrev(), self.field)
    }

    /// Parse `"{type}/{id}"`
    pub fn parse(key: &str) -> Option<Self> {
        let (abbrev, field) = key.split_once('/')?;
        Some(Self::new(FieldType::from_abbrev(abbrev)?, field))
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.field_type.abbrev(), self.field)
    }
}

// =============================================================================
// Raw Values
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub ident: String,
    pub who: String,
    pub text: String,
}

/// User-provided field content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text { body: String, format: String },
    File { filename: String, content_type: String, size: u64, uri: String },
    Link { uri: String },
    Conversation { messages: Vec<ConversationMessage> },
    Datetime { value: i64 },
    Keywordset { keywords: Vec<String> },
    Layout { blocks: BTreeMap<String, String> },
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text { .. } => FieldType::Text,
            FieldValue::File { .. } => FieldType::File,
            FieldValue::Link { .. } => FieldType::Link,
            FieldValue::Conversation { .. } => FieldType::Conversation,
            FieldValue::Datetime { .. } => FieldType::Datetime,
            FieldValue::Keywordset { .. } => FieldType::Keywordset,
            FieldValue::Layout { .. } => FieldType::Layout,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        FieldValue::Text { body: body.into(), format: "PLAIN".to_string() }
    }
}

// =============================================================================
// Extracted Artifacts
// =============================================================================

/// Text extracted by the processing pipeline, optionally split
/// (conversation messages, layout blocks)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedText {
    pub text: String,
    pub split_text: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct Classification {
    pub labelset: String,
    pub label: String,
    pub cancelled_by_user: bool,
}

impl Classification {
    pub fn new(labelset: impl Into<String>, label: impl Into<String>) -> Self {
        Self { labelset: labelset.into(), label: label.into(), cancelled_by_user: false }
    }

    /// `"{labelset}/{label}"`
    pub fn path(&self) -> String {
        format!("{}/{}", self.labelset, self.label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParagraphKind {
    #[default]
    Text,
    Ocr,
    Inception,
    Description,
    Transcript,
    Title,
    Table,
}

impl ParagraphKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParagraphKind::Text => "TEXT",
            ParagraphKind::Ocr => "OCR",
            ParagraphKind::Inception => "INCEPTION",
            ParagraphKind::Description => "DESCRIPTION",
            ParagraphKind::Transcript => "TRANSCRIPT",
            ParagraphKind::Title => "TITLE",
            ParagraphKind::Table => "TABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePosition {
    pub page: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paragraph {
    pub start: u32,
    pub end: u32,
    pub kind: ParagraphKind,
    pub classifications: Vec<Classification>,
    pub page: Option<PagePosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub text: String,
    pub label: String,
}

/// Computed metadata of one field (or one split of it)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMetadata {
    pub paragraphs: Vec<Paragraph>,
    pub classifications: Vec<Classification>,
    pub entities: Vec<Entity>,
    pub relations: Vec<super::Relation>,
    pub summary: String,
    pub language: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldComputedMetadata {
    pub metadata: FieldMetadata,
    pub split_metadata: BTreeMap<String, FieldMetadata>,
    pub deleted_splits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vector {
    pub start: u32,
    pub end: u32,
    pub start_paragraph: u32,
    pub end_paragraph: u32,
    pub vector: Vec<f32>,
}

/// Embeddings of one field for one vectorset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorObject {
    pub vectors: Vec<Vector>,
    pub split_vectors: BTreeMap<String, Vec<Vector>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    #[default]
    Error,
    Warning,
}

/// Processing error reported for a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: FieldId,
    pub error: String,
    #[serde(default)]
    pub severity: ErrorSeverity,
}

impl FieldError {
    pub fn new(field: FieldId, error: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self { field, error: error.into(), severity }
    }
}
