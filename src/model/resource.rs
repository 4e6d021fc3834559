//! Resource-level records: basic, origin, security, relations

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Classification, FieldId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    #[default]
    Pending,
    Processed,
    Error,
    Blocked,
    Expired,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Pending => "PENDING",
            ResourceStatus::Processed => "PROCESSED",
            ResourceStatus::Error => "ERROR",
            ResourceStatus::Blocked => "BLOCKED",
            ResourceStatus::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub status: ResourceStatus,
    pub language: String,
    pub languages: Vec<String>,
    pub useful: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMetadata {
    pub classifications: Vec<Classification>,
    pub relations: Vec<Relation>,
}

/// User classification of one paragraph; `key` is a paragraph id whose
/// first segment (the resource id) is ignored
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParagraphAnnotation {
    pub key: String,
    pub classifications: Vec<Classification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFieldMetadata {
    pub field: FieldId,
    #[serde(default)]
    pub paragraphs: Vec<ParagraphAnnotation>,
}

/// The resource's main record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Basic {
    pub slug: String,
    pub title: String,
    pub summary: String,
    pub icon: String,
    pub thumbnail: String,
    pub hidden: bool,
    pub created: i64,
    pub modified: i64,
    pub metadata: Option<Metadata>,
    pub usermetadata: Option<UserMetadata>,
    pub fieldmetadata: Vec<UserFieldMetadata>,
    pub last_seqid: i64,
}

impl Basic {
    pub fn status(&self) -> ResourceStatus {
        self.metadata.as_ref().map(|m| m.status).unwrap_or_default()
    }

    pub fn set_status(&mut self, status: ResourceStatus) {
        self.metadata.get_or_insert_with(Metadata::default).status = status;
    }

    /// Merge an update into this record
    ///
    /// Non-empty scalars overwrite, an existing icon never changes, present
    /// optional sections replace, field annotations are upserted per field.
    pub fn merge_from(&mut self, other: &Basic) {
        fn merge_str(target: &mut String, value: &str) {
            if !value.is_empty() {
                *target = value.to_string();
            }
        }
        merge_str(&mut self.slug, &other.slug);
        merge_str(&mut self.title, &other.title);
        merge_str(&mut self.summary, &other.summary);
        merge_str(&mut self.thumbnail, &other.thumbnail);
        if self.icon.is_empty() {
            self.icon = other.icon.clone();
        }
        if other.hidden {
            self.hidden = true;
        }
        if other.created != 0 {
            self.created = other.created;
        }
        if other.modified != 0 {
            self.modified = other.modified;
        }
        if other.metadata.is_some() {
            self.metadata = other.metadata.clone();
        }
        if other.usermetadata.is_some() {
            self.usermetadata = other.usermetadata.clone();
        }
        for update in &other.fieldmetadata {
            match self.fieldmetadata.iter_mut().find(|m| m.field == update.field) {
                Some(existing) => *existing = update.clone(),
                None => self.fieldmetadata.push(update.clone()),
            }
        }
        if other.last_seqid > self.last_seqid {
            self.last_seqid = other.last_seqid;
        }
    }

    pub fn user_field_metadata(&self, field: &FieldId) -> Option<&UserFieldMetadata> {
        self.fieldmetadata.iter().find(|m| &m.field == field)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Origin {
    pub source_id: String,
    pub url: String,
    pub created: i64,
    pub modified: i64,
    pub tags: Vec<String>,
    pub colaborators: Vec<String>,
    pub filename: String,
    pub path: String,
    pub source: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Security {
    pub access_groups: Vec<String>,
}

// =============================================================================
// Relations
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    #[default]
    Entity,
    Label,
    Resource,
    User,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    Child,
    About,
    #[default]
    Entity,
    Colab,
    Synonym,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationNode {
    pub value: String,
    pub ntype: NodeType,
    pub subtype: String,
}

impl RelationNode {
    pub fn new(value: impl Into<String>, ntype: NodeType, subtype: impl Into<String>) -> Self {
        Self { value: value.into(), ntype, subtype: subtype.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Relation {
    pub relation: RelationType,
    pub source: RelationNode,
    pub to: RelationNode,
    pub label: String,
}
