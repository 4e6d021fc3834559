//! Per-field and per-resource generators of the index message
//!
//! Keys produced here:
//! ```text
//! field key      {type}/{id}
//! full field id  {rid}/{type}/{id}[/{split}]
//! paragraph      {full field id}/{start}-{end}
//! sentence       {full field id}/{index}/{start}-{end}
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{AtlasError, Result};
use crate::model::{
    now_secs, ExtractedText, FieldComputedMetadata, NodeType, Relation, RelationNode,
    RelationType, ResourceStatus, UserFieldMetadata, Vector, VectorObject,
};
use crate::orm::Resource;
use super::message::{
    IndexMessage, IndexParagraph, IndexStatus, ParagraphPosition, TextInformation, VectorSentence,
};

/// Relations derived from resource-level metadata live under this key
pub const METADATA_RELATIONS_KEY: &str = "a/metadata";

/// Rebase a user-supplied paragraph id onto `rid`
pub fn compute_paragraph_key(rid: &str, paragraph_key: &str) -> String {
    match paragraph_key.split_once('/') {
        Some((_, rest)) => format!("{}/{}", rid, rest),
        None => paragraph_key.to_string(),
    }
}

/// Refuse resources the index could not hold. The error names the field
/// at which the running paragraph count first passes the limit.
pub fn validate_indexable(brain: &IndexMessage, max_paragraphs: usize) -> Result<()> {
    let mut paragraphs = 0usize;
    for (field_key, field) in &brain.paragraphs {
        paragraphs += field.paragraphs.len();
        if paragraphs > max_paragraphs {
            return Err(AtlasError::ResourceNotIndexable {
                uuid: brain.uuid().to_string(),
                field: field_key.clone(),
                reason: format!(
                    "{} paragraphs exceed the limit of {}",
                    brain.paragraph_count(),
                    max_paragraphs
                ),
            });
        }
    }
    Ok(())
}

/// Keep at most `max` entity facet labels (`/e/...`) on each text,
/// returning a `(field key, warning)` pair per trimmed field
pub fn trim_entity_facets(brain: &mut IndexMessage, max: usize) -> Vec<(String, String)> {
    let mut warnings = Vec::new();
    for (field_key, text) in brain.texts.iter_mut() {
        let before = text.labels.len();
        let mut kept = 0usize;
        text.labels.retain(|label| {
            if !label.starts_with("/e/") {
                return true;
            }
            kept += 1;
            kept <= max
        });
        let dropped = before - text.labels.len();
        if dropped > 0 {
            warnings.push((
                field_key.clone(),
                format!("Too many entity facets: {} dropped (limit {})", dropped, max),
            ));
        }
    }
    warnings
}

/// Statuses the index exposes: a resource that was processed once stays
/// processed, otherwise pending until processing finishes
fn index_status(status: ResourceStatus, previous: Option<ResourceStatus>) -> IndexStatus {
    if matches!(previous, Some(p) if p != ResourceStatus::Pending) {
        return IndexStatus::Processed;
    }
    match status {
        ResourceStatus::Pending => IndexStatus::Pending,
        _ => IndexStatus::Processed,
    }
}

/// Labels cancelled by the user at resource level, as `labelset/label`
pub(crate) fn user_cancelled_labels(resource: &Resource) -> HashSet<String> {
    resource
        .basic()
        .usermetadata
        .iter()
        .flat_map(|m| m.classifications.iter())
        .filter(|c| c.cancelled_by_user)
        .map(|c| c.path())
        .collect()
}

#[derive(Default)]
struct ParagraphClassifications {
    valid: HashMap<String, Vec<String>>,
    denied: HashMap<String, Vec<String>>,
}

fn paragraph_classifications(rid: &str, user: Option<&UserFieldMetadata>) -> ParagraphClassifications {
    let mut result = ParagraphClassifications::default();
    for annotation in user.iter().flat_map(|u| u.paragraphs.iter()) {
        let key = compute_paragraph_key(rid, &annotation.key);
        for classification in &annotation.classifications {
            let label = format!("/l/{}", classification.path());
            let target = if classification.cancelled_by_user {
                &mut result.denied
            } else {
                &mut result.valid
            };
            target.entry(key.clone()).or_default().push(label);
        }
    }
    result
}

/// Character slice `[start, end)` of `text`
fn paragraph_text(text: &str, start: u32, end: u32) -> String {
    text.chars()
        .skip(start as usize)
        .take(end.saturating_sub(start) as usize)
        .collect()
}

impl IndexMessage {
    fn full_field_id(&self, field_key: &str, split: Option<&str>) -> String {
        match split {
            Some(split) => format!("{}/{}/{}", self.resource.uuid, field_key, split),
            None => format!("{}/{}", self.resource.uuid, field_key),
        }
    }

    // =========================================================================
    // Resource Level
    // =========================================================================

    /// Status, dates, labels, metadata relations and security
    pub(crate) fn generate_resource_metadata(&mut self, resource: &Resource) {
        let basic = resource.basic();
        let origin = resource.origin();

        self.status = index_status(basic.status(), resource.previous_status());

        let origin_created = origin.map(|o| o.created).unwrap_or(0);
        let origin_modified = origin.map(|o| o.modified).unwrap_or(0);
        self.metadata.created = [basic.created, origin_created, now_secs()]
            .into_iter()
            .find(|t| *t != 0)
            .unwrap_or_default();
        self.metadata.modified = [basic.modified, origin_modified, self.metadata.created]
            .into_iter()
            .find(|t| *t != 0)
            .unwrap_or_default();

        let mut labels = BTreeSet::new();
        if !basic.icon.is_empty() {
            labels.insert(format!("/n/i/{}", basic.icon));
        }
        labels.insert(format!("/n/s/{}", basic.status().as_str()));
        if let Some(metadata) = &basic.metadata {
            for language in std::iter::once(&metadata.language).chain(metadata.languages.iter()) {
                if !language.is_empty() {
                    labels.insert(format!("/s/p/{}", language));
                }
            }
        }
        if basic.hidden {
            labels.insert("/q/h".to_string());
        }

        let rid_node = RelationNode::new(resource.uuid(), NodeType::Resource, "");
        let mut relations = Vec::new();
        if let Some(user) = &basic.usermetadata {
            for classification in user.classifications.iter().filter(|c| !c.cancelled_by_user) {
                labels.insert(format!("/l/{}", classification.path()));
                relations.push(Relation {
                    relation: RelationType::About,
                    source: rid_node.clone(),
                    to: RelationNode::new(classification.path(), NodeType::Label, ""),
                    label: String::new(),
                });
            }
            relations.extend(user.relations.iter().cloned());
        }

        if let Some(origin) = origin {
            if !origin.source_id.is_empty() {
                labels.insert(format!("/o/{}", origin.source_id));
            }
            for tag in &origin.tags {
                labels.insert(format!("/t/{}", tag));
            }
            if !origin.source.is_empty() {
                labels.insert(format!("/u/s/{}", origin.source));
            }
            for colaborator in &origin.colaborators {
                labels.insert(format!("/u/o/{}", colaborator));
                relations.push(Relation {
                    relation: RelationType::Colab,
                    source: rid_node.clone(),
                    to: RelationNode::new(colaborator, NodeType::User, ""),
                    label: String::new(),
                });
            }
            if !origin.path.is_empty() {
                labels.insert(format!("/p/{}", origin.path.trim_start_matches('/')));
            }
            for (key, value) in &origin.metadata {
                labels.insert(format!("/m/{}/{}", key, value));
            }
        }

        self.labels = labels.into_iter().collect();
        if relations.is_empty() {
            self.field_relations.remove(METADATA_RELATIONS_KEY);
        } else {
            self.field_relations.insert(METADATA_RELATIONS_KEY.to_string(), relations);
        }
        self.relation_fields_to_delete.push(METADATA_RELATIONS_KEY.to_string());
        self.set_security(resource.security());
    }

    /// Drop everything indexed for a field
    pub(crate) fn delete_field(&mut self, field_key: &str) {
        let full = self.full_field_id(field_key, None);
        self.texts_to_delete.push(full.clone());
        self.paragraphs_to_delete.push(full.clone());
        self.sentences_to_delete.push(full);
        self.relation_fields_to_delete.push(field_key.to_string());
    }

    // =========================================================================
    // Field Level
    // =========================================================================

    pub(crate) fn apply_field_text(
        &mut self,
        field_key: &str,
        extracted: &ExtractedText,
        metadata: Option<&FieldComputedMetadata>,
        cancelled: &HashSet<String>,
        replace: bool,
        skip_index: bool,
    ) {
        let mut text = extracted.text.clone();
        for split_text in extracted.split_text.values() {
            text.push_str(&format!(" {} ", split_text));
        }

        let mut labels = BTreeSet::new();
        if let Some(computed) = metadata {
            for field_metadata in std::iter::once(&computed.metadata).chain(computed.split_metadata.values()) {
                if !field_metadata.mime_type.is_empty() {
                    labels.insert(format!("/mt/{}", field_metadata.mime_type));
                }
                for classification in &field_metadata.classifications {
                    if !cancelled.contains(&classification.path()) {
                        labels.insert(format!("/l/{}", classification.path()));
                    }
                }
                for entity in &field_metadata.entities {
                    labels.insert(format!("/e/{}/{}", entity.label, entity.text));
                }
            }
        }

        self.texts.insert(
            field_key.to_string(),
            TextInformation { text, labels: labels.into_iter().collect() },
        );
        if replace {
            let full = self.full_field_id(field_key, None);
            self.texts_to_delete.push(full);
        }
        self.skip_texts = Some(skip_index);
    }

    pub(crate) fn apply_field_paragraphs(
        &mut self,
        field_key: &str,
        computed: &FieldComputedMetadata,
        extracted: &ExtractedText,
        user: Option<&UserFieldMetadata>,
        replace: bool,
        skip_index: bool,
    ) {
        let rid = self.resource.uuid.clone();
        let user_labels = paragraph_classifications(&rid, user);
        let mut seen_texts = HashSet::new();

        let sections = computed
            .split_metadata
            .iter()
            .map(|(split, m)| (Some(split.as_str()), m, extracted.split_text.get(split).map(String::as_str)))
            .chain(std::iter::once((None, &computed.metadata, Some(extracted.text.as_str()))));

        let mut generated = Vec::new();
        for (split, field_metadata, text) in sections {
            let field_id = self.full_field_id(field_key, split);
            for (index, paragraph) in field_metadata.paragraphs.iter().enumerate() {
                let key = format!("{}/{}-{}", field_id, paragraph.start, paragraph.end);

                let repeated_in_field = match text {
                    Some(text) => !seen_texts.insert(paragraph_text(text, paragraph.start, paragraph.end)),
                    None => false,
                };

                let mut labels = BTreeSet::new();
                labels.insert(format!("/k/{}", paragraph.kind.as_str().to_lowercase()));
                for classification in &paragraph.classifications {
                    labels.insert(format!("/l/{}", classification.path()));
                }
                if let Some(valid) = user_labels.valid.get(&key) {
                    labels.extend(valid.iter().cloned());
                }
                if let Some(denied) = user_labels.denied.get(&key) {
                    for label in denied {
                        labels.remove(label);
                    }
                }

                let position = ParagraphPosition {
                    index: index as u64,
                    start: paragraph.start,
                    end: paragraph.end,
                    page_number: paragraph.page.map(|p| p.page).unwrap_or(0),
                    in_page: paragraph.page.is_some(),
                };
                generated.push((
                    key,
                    IndexParagraph {
                        start: paragraph.start,
                        end: paragraph.end,
                        labels: labels.into_iter().collect(),
                        field: field_key.to_string(),
                        split: split.unwrap_or_default().to_string(),
                        index: index as u64,
                        repeated_in_field,
                        position,
                        vectorsets_sentences: Default::default(),
                    },
                ));
            }
        }

        let entry = self.paragraphs.entry(field_key.to_string()).or_default();
        for (key, paragraph) in generated {
            entry.paragraphs.insert(key, paragraph);
        }
        if replace {
            let full = self.full_field_id(field_key, None);
            self.paragraphs_to_delete.push(full);
        }
        self.skip_paragraphs = Some(skip_index);
    }

    pub(crate) fn apply_field_vectors(
        &mut self,
        field_key: &str,
        vectors: &VectorObject,
        vectorset: &str,
        dimension: Option<usize>,
        replace: bool,
    ) {
        for (split, split_vectors) in &vectors.split_vectors {
            for (index, vector) in split_vectors.iter().enumerate() {
                self.apply_field_vector(field_key, Some(split), index, vector, vectorset, dimension);
            }
        }
        for (index, vector) in vectors.vectors.iter().enumerate() {
            self.apply_field_vector(field_key, None, index, vector, vectorset, dimension);
        }
        if replace {
            let full = self.full_field_id(field_key, None);
            self.vector_prefixes_to_delete
                .entry(vectorset.to_string())
                .or_default()
                .push(full);
        }
    }

    fn apply_field_vector(
        &mut self,
        field_key: &str,
        split: Option<&str>,
        index: usize,
        vector: &Vector,
        vectorset: &str,
        dimension: Option<usize>,
    ) {
        let field_id = self.full_field_id(field_key, split);
        let paragraph_key = format!("{}/{}-{}", field_id, vector.start_paragraph, vector.end_paragraph);
        let sentence_key = format!("{}/{}/{}-{}", field_id, index, vector.start, vector.end);

        let paragraph = self
            .paragraphs
            .entry(field_key.to_string())
            .or_default()
            .paragraphs
            .entry(paragraph_key)
            .or_default();
        let position = ParagraphPosition {
            index: paragraph.position.index,
            start: vector.start,
            end: vector.end,
            page_number: paragraph.position.page_number,
            in_page: paragraph.position.in_page,
        };
        let values = match dimension {
            Some(dimension) => vector.vector[..dimension.min(vector.vector.len())].to_vec(),
            None => vector.vector.clone(),
        };
        paragraph
            .vectorsets_sentences
            .entry(vectorset.to_string())
            .or_default()
            .sentences
            .insert(sentence_key, VectorSentence { vector: values, position });
    }

    pub(crate) fn apply_field_relations(
        &mut self,
        field_key: &str,
        metadata: Option<&FieldComputedMetadata>,
        cancelled: &HashSet<String>,
        replace: bool,
    ) {
        let rid_node = RelationNode::new(self.resource.uuid.clone(), NodeType::Resource, "");
        let mut relations = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |relation: Relation| {
            if seen.insert(relation.clone()) {
                relations.push(relation);
            }
        };

        if let Some(computed) = metadata {
            for field_metadata in std::iter::once(&computed.metadata).chain(computed.split_metadata.values()) {
                for relation in &field_metadata.relations {
                    push(relation.clone());
                }
                for entity in &field_metadata.entities {
                    push(Relation {
                        relation: RelationType::Entity,
                        source: rid_node.clone(),
                        to: RelationNode::new(entity.text.clone(), NodeType::Entity, entity.label.clone()),
                        label: String::new(),
                    });
                }
                for classification in &field_metadata.classifications {
                    if cancelled.contains(&classification.path()) {
                        continue;
                    }
                    push(Relation {
                        relation: RelationType::About,
                        source: rid_node.clone(),
                        to: RelationNode::new(classification.path(), NodeType::Label, ""),
                        label: String::new(),
                    });
                }
            }
        }

        if !relations.is_empty() {
            self.field_relations.insert(field_key.to_string(), relations);
        }
        if replace {
            self.relation_fields_to_delete.push(field_key.to_string());
        }
    }
}
