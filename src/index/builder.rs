//! Index message builder
//!
//! Decides per field which categories a batch of broker messages makes stale
//! and drives the generators in `brain` over the stored field artifacts.

use std::collections::{BTreeSet, HashSet};

use tracing::trace;

use crate::error::{AtlasError, Result};
use crate::kv::Transaction;
use crate::model::{BrokerMessage, FieldId, MessageSource};
use crate::orm::{Resource, VectorSetConfig};
use super::brain::user_cancelled_labels;
use super::message::IndexMessage;

/// What to (re)compute for one field
#[derive(Debug, Clone, Copy)]
struct FieldUpdate {
    texts: bool,
    paragraphs: bool,
    vectors: bool,
    relations: bool,
    replace: bool,
}

impl FieldUpdate {
    fn everything(replace: bool) -> Self {
        Self { texts: true, paragraphs: true, vectors: true, relations: true, replace }
    }
}

/// Builds the `IndexMessage` of one resource
pub struct IndexMessageBuilder<'a> {
    resource: &'a Resource,
    vectorsets: Vec<VectorSetConfig>,
    brain: IndexMessage,
    cancelled_labels: HashSet<String>,
}

impl<'a> IndexMessageBuilder<'a> {
    pub fn new(resource: &'a Resource, vectorsets: Vec<VectorSetConfig>) -> Self {
        Self {
            resource,
            vectorsets,
            brain: IndexMessage::new(resource.uuid()),
            cancelled_labels: user_cancelled_labels(resource),
        }
    }

    // =========================================================================
    // Entry Paths
    // =========================================================================

    /// Writer messages never carry extracted data: only annotations, field
    /// adds and deletes. Vectors and relations are left alone.
    pub async fn for_writer_bm(
        mut self,
        txn: &mut dyn Transaction,
        messages: &[BrokerMessage],
        resource_created: bool,
    ) -> Result<IndexMessage> {
        assert!(
            messages.iter().all(|m| m.source == MessageSource::Writer),
            "writer index message built from non-writer broker messages"
        );

        let deleted = deleted_fields(messages);
        self.apply_field_deletions(&deleted);
        self.brain.generate_resource_metadata(self.resource);

        // The texts index doubles as the prefilter index, so resource-level
        // filter changes make every field's text stale
        let prefilter_update = messages.iter().any(|m| m.reindex);
        let fields = if prefilter_update {
            self.resource.field_ids()
        } else {
            modified_fields(messages)?
        };

        for field in fields.iter().filter(|f| !deleted.contains(f)) {
            let update = FieldUpdate {
                texts: prefilter_update || needs_texts_update(field, messages),
                paragraphs: needs_paragraphs_update(field, messages),
                vectors: false,
                relations: false,
                replace: !resource_created,
            };
            self.apply_field_index_data(txn, field, update).await?;
        }
        Ok(self.brain)
    }

    /// Processor messages supersede whatever is indexed for the fields they touch
    pub async fn for_processor_bm(
        mut self,
        txn: &mut dyn Transaction,
        messages: &[BrokerMessage],
    ) -> Result<IndexMessage> {
        assert!(
            messages.iter().all(|m| m.source == MessageSource::Processor),
            "processor index message built from non-processor broker messages"
        );

        let deleted = deleted_fields(messages);
        self.apply_field_deletions(&deleted);
        self.brain.generate_resource_metadata(self.resource);

        for field in modified_fields(messages)?.iter().filter(|f| !deleted.contains(f)) {
            let update = FieldUpdate {
                texts: needs_texts_update(field, messages),
                paragraphs: needs_paragraphs_update(field, messages),
                vectors: needs_vectors_update(field, messages),
                relations: needs_relations_update(field, messages),
                replace: true,
            };
            self.apply_field_index_data(txn, field, update).await?;
        }
        Ok(self.brain)
    }

    /// Everything for every field; `reindex` replaces what the shard holds
    pub async fn full(mut self, txn: &mut dyn Transaction, reindex: bool) -> Result<IndexMessage> {
        self.brain.generate_resource_metadata(self.resource);
        for field in self.resource.field_ids() {
            self.apply_field_index_data(txn, &field, FieldUpdate::everything(reindex)).await?;
        }
        Ok(self.brain)
    }

    // =========================================================================
    // Field Data
    // =========================================================================

    fn apply_field_deletions(&mut self, fields: &[FieldId]) {
        for field in fields {
            self.brain.delete_field(&field.key());
        }
    }

    async fn apply_field_index_data(
        &mut self,
        txn: &mut dyn Transaction,
        field: &FieldId,
        update: FieldUpdate,
    ) -> Result<()> {
        let field_key = field.key();
        let extracted = self.resource.get_extracted_text(txn, field).await?;
        let computed = self.resource.get_field_metadata(txn, field).await?;
        let user = self.resource.basic().user_field_metadata(field);
        trace!(uuid = %self.resource.uuid(), field = %field_key, ?update, "Indexing field");

        // Texts feed paragraphs, and paragraphs feed vectors: compute the
        // upstream category without indexing it when only the downstream one
        // is stale
        if update.texts || update.paragraphs {
            let skip = !update.texts;
            if let Some(extracted) = &extracted {
                self.brain.apply_field_text(
                    &field_key,
                    extracted,
                    computed.as_ref(),
                    &self.cancelled_labels,
                    update.replace && !skip,
                    skip,
                );
            }
        }

        if update.paragraphs || update.vectors {
            let skip = !update.paragraphs;
            if let (Some(extracted), Some(computed)) = (&extracted, &computed) {
                self.brain.apply_field_paragraphs(
                    &field_key,
                    computed,
                    extracted,
                    user,
                    update.replace && !skip,
                    skip,
                );
            }
        }

        if update.vectors {
            for vectorset in &self.vectorsets {
                let Some(vectors) = self.resource.get_vectors(txn, field, &vectorset.vectorset_id).await? else {
                    continue;
                };
                self.brain.apply_field_vectors(
                    &field_key,
                    &vectors,
                    &vectorset.vectorset_id,
                    vectorset.vector_dimension,
                    update.replace,
                );
            }
        }

        if update.relations {
            self.brain.apply_field_relations(&field_key, computed.as_ref(), &self.cancelled_labels, update.replace);
        }
        Ok(())
    }
}

// =============================================================================
// Update Predicates
// =============================================================================

/// The single source shared by every message of a batch
pub fn messages_source(messages: &[BrokerMessage]) -> Result<MessageSource> {
    let mut sources = messages.iter().map(|m| m.source);
    let first = sources
        .next()
        .ok_or_else(|| AtlasError::InvalidMessage("empty broker message batch".into()))?;
    if sources.any(|s| s != first) {
        return Err(AtlasError::InvalidMessage("broker message batch mixes sources".into()));
    }
    Ok(first)
}

fn deleted_fields(messages: &[BrokerMessage]) -> Vec<FieldId> {
    let mut deleted = Vec::new();
    for field in messages.iter().flat_map(|m| m.delete_fields.iter()) {
        if !deleted.contains(field) {
            deleted.push(field.clone());
        }
    }
    deleted
}

/// Fields a batch touched: added values, title/summary of a basic update,
/// and either extracted artifacts (processor) or user annotations (writer)
fn modified_fields(messages: &[BrokerMessage]) -> Result<Vec<FieldId>> {
    let source = messages_source(messages)?;
    let mut modified = BTreeSet::new();
    for message in messages {
        modified.extend(message.field_values().map(|(field, _)| field));
        modified.extend(message.generic_fields());

        match source {
            MessageSource::Processor => {
                modified.extend(message.field_metadata.iter().map(|m| m.field.clone()));
                modified.extend(message.extracted_text.iter().map(|t| t.field.clone()));
                modified.extend(message.field_vectors.iter().map(|v| v.field.clone()));
            }
            MessageSource::Writer => {
                if let Some(basic) = &message.basic {
                    modified.extend(basic.fieldmetadata.iter().map(|m| m.field.clone()));
                }
            }
        }
    }
    Ok(modified.into_iter().collect())
}

fn has_new_extracted_text(field: &FieldId, messages: &[BrokerMessage]) -> bool {
    messages.iter().any(|m| m.extracted_text.iter().any(|t| &t.field == field))
}

fn has_new_field_metadata(field: &FieldId, messages: &[BrokerMessage]) -> bool {
    messages.iter().any(|m| m.field_metadata.iter().any(|fm| &fm.field == field))
}

fn needs_texts_update(field: &FieldId, messages: &[BrokerMessage]) -> bool {
    has_new_extracted_text(field, messages) || has_new_field_metadata(field, messages)
}

fn needs_paragraphs_update(field: &FieldId, messages: &[BrokerMessage]) -> bool {
    messages.iter().any(|m| m.has_paragraph_annotations(field)) || needs_texts_update(field, messages)
}

fn needs_vectors_update(field: &FieldId, messages: &[BrokerMessage]) -> bool {
    messages.iter().any(|m| m.field_vectors.iter().any(|v| &v.field == field))
}

fn needs_relations_update(field: &FieldId, messages: &[BrokerMessage]) -> bool {
    needs_texts_update(field, messages)
}
