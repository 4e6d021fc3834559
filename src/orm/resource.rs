//! Resources and their fields
//!
//! A `Resource` caches its basic/origin/security records and field list in
//! memory and writes every mutation straight into the caller's transaction.
//! `modified` turns true on the first mutation; an aborted transaction must
//! be followed by dropping the value, since the cached records would no
//! longer match the store.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::{AtlasError, Result};
use crate::keys;
use crate::kv::{self, Transaction};
use crate::model::{
    now_secs, Basic, BrokerMessage, ErrorSeverity, ExtractedText, FieldComputedMetadata, FieldError,
    FieldId, FieldMetadata, FieldType, FieldValue, MessageSource, Origin, ResourceStatus, Security, VectorObject,
};
use super::VectorSetConfig;

#[derive(Debug, Clone)]
pub struct Resource {
    kbid: String,
    uuid: String,
    basic: Basic,
    origin: Option<Origin>,
    security: Option<Security>,
    fields: BTreeSet<FieldId>,
    previous_status: Option<ResourceStatus>,
    /// Set by any mutation since load
    pub modified: bool,
}

impl Resource {
    // =========================================================================
    // Loading
    // =========================================================================

    pub async fn load(txn: &mut dyn Transaction, kbid: &str, uuid: &str) -> Result<Option<Self>> {
        let Some(basic) = kv::get_record::<Basic>(txn, &keys::resource_basic(kbid, uuid)).await? else {
            return Ok(None);
        };
        let origin = kv::get_record(txn, &keys::resource_origin(kbid, uuid)).await?;
        let security = kv::get_record(txn, &keys::resource_security(kbid, uuid)).await?;
        let fields: Vec<FieldId> = kv::get_record(txn, &keys::resource_all_fields(kbid, uuid))
            .await?
            .unwrap_or_default();

        Ok(Some(Self {
            kbid: kbid.to_string(),
            uuid: uuid.to_string(),
            basic,
            origin,
            security,
            fields: fields.into_iter().collect(),
            previous_status: None,
            modified: false,
        }))
    }

    pub(crate) async fn create(txn: &mut dyn Transaction, kbid: &str, uuid: &str, basic: Basic) -> Result<Self> {
        let mut resource = Self {
            kbid: kbid.to_string(),
            uuid: uuid.to_string(),
            basic,
            origin: None,
            security: None,
            fields: BTreeSet::new(),
            previous_status: None,
            modified: false,
        };
        resource.save_basic(txn).await?;
        Ok(resource)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn kbid(&self) -> &str {
        &self.kbid
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn slug(&self) -> &str {
        &self.basic.slug
    }

    pub fn basic(&self) -> &Basic {
        &self.basic
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn security(&self) -> Option<&Security> {
        self.security.as_ref()
    }

    /// Status before the first `set_basic` of this load, if it changed
    pub fn previous_status(&self) -> Option<ResourceStatus> {
        self.previous_status
    }

    /// Stored fields plus the generic title/summary when they are set
    pub fn field_ids(&self) -> Vec<FieldId> {
        let mut ids = self.fields.clone();
        if !self.basic.title.is_empty() {
            ids.insert(FieldId::new(FieldType::Generic, "title"));
        }
        if !self.basic.summary.is_empty() {
            ids.insert(FieldId::new(FieldType::Generic, "summary"));
        }
        ids.into_iter().collect()
    }

    pub fn has_field(&self, field: &FieldId) -> bool {
        self.fields.contains(field)
    }

    // =========================================================================
    // Resource Records
    // =========================================================================

    pub async fn set_basic(&mut self, txn: &mut dyn Transaction, update: &Basic) -> Result<()> {
        if self.previous_status.is_none() {
            self.previous_status = Some(self.basic.status());
        }
        self.basic.merge_from(update);
        self.basic.modified = now_secs().max(self.basic.modified);
        self.save_basic(txn).await
    }

    pub async fn set_status(&mut self, txn: &mut dyn Transaction, status: ResourceStatus) -> Result<()> {
        if self.previous_status.is_none() {
            self.previous_status = Some(self.basic.status());
        }
        self.basic.set_status(status);
        self.save_basic(txn).await
    }

    pub async fn set_last_seqid(&mut self, txn: &mut dyn Transaction, seqid: i64) -> Result<()> {
        self.basic.last_seqid = seqid;
        kv::set_record(txn, &keys::resource_basic(&self.kbid, &self.uuid), &self.basic).await
    }

    pub async fn set_origin(&mut self, txn: &mut dyn Transaction, origin: &Origin) -> Result<()> {
        kv::set_record(txn, &keys::resource_origin(&self.kbid, &self.uuid), origin).await?;
        self.origin = Some(origin.clone());
        self.modified = true;
        Ok(())
    }

    pub async fn set_security(&mut self, txn: &mut dyn Transaction, security: &Security) -> Result<()> {
        kv::set_record(txn, &keys::resource_security(&self.kbid, &self.uuid), security).await?;
        self.security = Some(security.clone());
        self.modified = true;
        Ok(())
    }

    async fn save_basic(&mut self, txn: &mut dyn Transaction) -> Result<()> {
        kv::set_record(txn, &keys::resource_basic(&self.kbid, &self.uuid), &self.basic).await?;
        self.modified = true;
        Ok(())
    }

    async fn save_fields(&mut self, txn: &mut dyn Transaction) -> Result<()> {
        let fields: Vec<&FieldId> = self.fields.iter().collect();
        kv::set_record(txn, &keys::resource_all_fields(&self.kbid, &self.uuid), &fields).await?;
        self.modified = true;
        Ok(())
    }

    /// Remove every record of the resource
    pub async fn delete(self, txn: &mut dyn Transaction) -> Result<()> {
        kv::delete_prefix(txn, &keys::resource_prefix(&self.kbid, &self.uuid)).await?;
        txn.delete(&keys::resource_basic(&self.kbid, &self.uuid)).await
    }

    // =========================================================================
    // Fields
    // =========================================================================

    pub async fn set_field(&mut self, txn: &mut dyn Transaction, field: &FieldId, value: &FieldValue) -> Result<()> {
        if value.field_type() != field.field_type {
            return Err(AtlasError::InvalidMessage(format!(
                "field {} carries a {:?} value",
                field,
                value.field_type()
            )));
        }
        kv::set_record(txn, &keys::field_value(&self.kbid, &self.uuid, field), value).await?;
        if self.fields.insert(field.clone()) {
            self.save_fields(txn).await?;
        }
        self.modified = true;
        Ok(())
    }

    pub async fn get_field_value(&self, txn: &mut dyn Transaction, field: &FieldId) -> Result<Option<FieldValue>> {
        kv::get_record(txn, &keys::field_value(&self.kbid, &self.uuid, field)).await
    }

    /// Drop the field, its artifacts and its user annotations
    pub async fn delete_field(&mut self, txn: &mut dyn Transaction, field: &FieldId) -> Result<()> {
        kv::delete_prefix(txn, &keys::field_prefix(&self.kbid, &self.uuid, field)).await?;
        txn.delete(&keys::field_value(&self.kbid, &self.uuid, field)).await?;
        if self.fields.remove(field) {
            self.save_fields(txn).await?;
        }
        let before = self.basic.fieldmetadata.len();
        self.basic.fieldmetadata.retain(|m| &m.field != field);
        if self.basic.fieldmetadata.len() != before {
            self.save_basic(txn).await?;
        }
        self.modified = true;
        Ok(())
    }

    /// Register a field that only has extracted artifacts (e.g. generic fields)
    async fn ensure_field(&mut self, txn: &mut dyn Transaction, field: &FieldId) -> Result<()> {
        if field.field_type != FieldType::Generic && self.fields.insert(field.clone()) {
            self.save_fields(txn).await?;
        }
        Ok(())
    }

    pub async fn get_extracted_text(&self, txn: &mut dyn Transaction, field: &FieldId) -> Result<Option<ExtractedText>> {
        kv::get_record(txn, &keys::field_extracted_text(&self.kbid, &self.uuid, field)).await
    }

    pub async fn set_extracted_text(&mut self, txn: &mut dyn Transaction, field: &FieldId, text: &ExtractedText) -> Result<()> {
        self.ensure_field(txn, field).await?;
        kv::set_record(txn, &keys::field_extracted_text(&self.kbid, &self.uuid, field), text).await?;
        self.modified = true;
        Ok(())
    }

    pub async fn get_field_metadata(&self, txn: &mut dyn Transaction, field: &FieldId) -> Result<Option<FieldComputedMetadata>> {
        kv::get_record(txn, &keys::field_metadata(&self.kbid, &self.uuid, field)).await
    }

    /// Store computed metadata, dropping deleted splits of the stored copy
    pub async fn set_field_metadata(
        &mut self,
        txn: &mut dyn Transaction,
        field: &FieldId,
        update: &FieldComputedMetadata,
    ) -> Result<()> {
        self.ensure_field(txn, field).await?;
        let mut stored = self.get_field_metadata(txn, field).await?.unwrap_or_default();
        stored.metadata = update.metadata.clone();
        for (split, metadata) in &update.split_metadata {
            stored.split_metadata.insert(split.clone(), metadata.clone());
        }
        for split in &update.deleted_splits {
            stored.split_metadata.remove(split);
        }
        stored.deleted_splits.clear();
        kv::set_record(txn, &keys::field_metadata(&self.kbid, &self.uuid, field), &stored).await?;

        if self.basic.summary.is_empty() && !update.metadata.summary.is_empty() {
            self.basic.summary = update.metadata.summary.clone();
            self.save_basic(txn).await?;
        }
        self.modified = true;
        Ok(())
    }

    pub async fn get_vectors(&self, txn: &mut dyn Transaction, field: &FieldId, vectorset: &str) -> Result<Option<VectorObject>> {
        kv::get_record(txn, &keys::field_vectors(&self.kbid, &self.uuid, field, vectorset)).await
    }

    pub async fn set_vectors(
        &mut self,
        txn: &mut dyn Transaction,
        field: &FieldId,
        vectorset: &str,
        vectors: &VectorObject,
    ) -> Result<()> {
        self.ensure_field(txn, field).await?;
        kv::set_record(txn, &keys::field_vectors(&self.kbid, &self.uuid, field, vectorset), vectors).await?;
        self.modified = true;
        Ok(())
    }

    pub async fn get_field_errors(&self, txn: &mut dyn Transaction, field: &FieldId) -> Result<Vec<FieldError>> {
        Ok(kv::get_record(txn, &keys::field_errors(&self.kbid, &self.uuid, field)).await?.unwrap_or_default())
    }

    /// Append an error to the field's stored error list
    pub async fn add_field_error(
        &mut self,
        txn: &mut dyn Transaction,
        field: &FieldId,
        error: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Result<()> {
        self.ensure_field(txn, field).await?;
        let mut errors = self.get_field_errors(txn, field).await?;
        errors.push(FieldError::new(field.clone(), error, severity));
        kv::set_record(txn, &keys::field_errors(&self.kbid, &self.uuid, field), &errors).await?;
        self.modified = true;
        Ok(())
    }

    /// Paragraph metadata of a field or one of its splits
    pub fn split_metadata<'a>(metadata: &'a FieldComputedMetadata, split: Option<&str>) -> Option<&'a FieldMetadata> {
        match split {
            None => Some(&metadata.metadata),
            Some(split) => metadata.split_metadata.get(split),
        }
    }

    // =========================================================================
    // Broker Message Application
    // =========================================================================

    /// Apply user field values and field deletions
    pub async fn apply_fields(&mut self, txn: &mut dyn Transaction, message: &BrokerMessage) -> Result<()> {
        for (field, value) in message.field_values() {
            self.set_field(txn, &field, value).await?;
        }
        for field in &message.delete_fields {
            debug!(uuid = %self.uuid, field = %field, "Deleting field");
            self.delete_field(txn, field).await?;
        }
        Ok(())
    }

    /// Apply extracted text, computed metadata, vectors and processing status
    pub async fn apply_extracted(
        &mut self,
        txn: &mut dyn Transaction,
        message: &BrokerMessage,
        vectorsets: &[VectorSetConfig],
    ) -> Result<()> {
        for extracted in &message.extracted_text {
            self.set_extracted_text(txn, &extracted.field, &extracted.body).await?;
        }
        for computed in &message.field_metadata {
            self.set_field_metadata(txn, &computed.field, &computed.metadata).await?;
        }
        for vectors in &message.field_vectors {
            let vectorset = if vectors.vectorset_id.is_empty() {
                match vectorsets {
                    [only] => only.vectorset_id.clone(),
                    [] => {
                        warn!(kbid = %self.kbid, "Vectors received for a KB without vectorsets; skipping");
                        continue;
                    }
                    _ => {
                        return Err(AtlasError::InvalidMessage(format!(
                            "vectors for {} need a vectorset id: the KB has {} vectorsets",
                            vectors.field,
                            vectorsets.len()
                        )))
                    }
                }
            } else if vectorsets.iter().any(|v| v.vectorset_id == vectors.vectorset_id) {
                vectors.vectorset_id.clone()
            } else {
                warn!(kbid = %self.kbid, vectorset = %vectors.vectorset_id, "Unknown vectorset; skipping vectors");
                continue;
            };
            self.set_vectors(txn, &vectors.field, &vectorset, &vectors.vectors).await?;
        }

        if message.source == MessageSource::Processor {
            let status = if message.errors.is_empty() {
                ResourceStatus::Processed
            } else {
                for error in &message.errors {
                    warn!(uuid = %self.uuid, field = %error.field, "Processing error: {}", error.error);
                    self.add_field_error(txn, &error.field, error.error.clone(), error.severity).await?;
                }
                ResourceStatus::Error
            };
            self.set_status(txn, status).await?;
        }
        Ok(())
    }
}
