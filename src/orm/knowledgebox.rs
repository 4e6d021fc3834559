//! Knowledge boxes
//!
//! A KB owns every key under `/kbs/{kbid}/`; its slug lives in the global
//! `/kbslugs/` namespace.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AtlasError, Result};
use crate::keys;
use crate::kv::{self, Transaction};
use crate::model::{now_secs, Basic};
use super::Resource;

/// Embedding space configured for a KB
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSetConfig {
    pub vectorset_id: String,
    /// Vectors are cut to this many dimensions when indexed
    pub vector_dimension: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBoxConfig {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub migration_version: u64,
    pub vectorsets: Vec<VectorSetConfig>,
}

/// Handle to one KB; cheap to construct
#[derive(Debug, Clone)]
pub struct KnowledgeBox {
    kbid: String,
}

impl KnowledgeBox {
    pub fn new(kbid: impl Into<String>) -> Self {
        Self { kbid: kbid.into() }
    }

    pub fn kbid(&self) -> &str {
        &self.kbid
    }

    // =========================================================================
    // KB Records
    // =========================================================================

    pub async fn exists(txn: &mut dyn Transaction, kbid: &str) -> Result<bool> {
        Ok(txn.get(&keys::kb_config(kbid)).await?.is_some())
    }

    pub async fn get_config(txn: &mut dyn Transaction, kbid: &str) -> Result<Option<KnowledgeBoxConfig>> {
        kv::get_record(txn, &keys::kb_config(kbid)).await
    }

    pub async fn get_kbid_by_slug(txn: &mut dyn Transaction, slug: &str) -> Result<Option<String>> {
        Ok(txn
            .get(&keys::kb_slug(slug))
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Create a KB; the slug must be unused
    pub async fn create(
        txn: &mut dyn Transaction,
        slug: &str,
        mut config: KnowledgeBoxConfig,
        forced_uuid: Option<String>,
    ) -> Result<String> {
        if slug.is_empty() {
            return Err(AtlasError::InvalidMessage("knowledge box slug is empty".into()));
        }
        let kbid = forced_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());

        match txn.insert(&keys::kb_slug(slug), Bytes::from(kbid.clone())).await {
            Err(AtlasError::Conflict(_)) => return Err(AtlasError::KnowledgeBoxConflict(slug.to_string())),
            other => other?,
        }
        if Self::exists(txn, &kbid).await? {
            return Err(AtlasError::KnowledgeBoxConflict(kbid));
        }

        config.slug = slug.to_string();
        kv::set_record(txn, &keys::kb_config(&kbid), &config).await?;
        info!(kbid = %kbid, slug, "Created knowledge box");
        Ok(kbid)
    }

    /// Replace a KB's configuration, moving its slug when `slug` is given
    pub async fn update(
        txn: &mut dyn Transaction,
        kbid: &str,
        slug: Option<&str>,
        mut config: KnowledgeBoxConfig,
    ) -> Result<String> {
        let current = Self::get_config(txn, kbid)
            .await?
            .ok_or_else(|| AtlasError::KnowledgeBoxNotFound(kbid.to_string()))?;

        match slug {
            Some(new_slug) if !new_slug.is_empty() && new_slug != current.slug => {
                match txn.insert(&keys::kb_slug(new_slug), Bytes::from(kbid.to_string())).await {
                    Err(AtlasError::Conflict(_)) => {
                        return Err(AtlasError::KnowledgeBoxConflict(new_slug.to_string()))
                    }
                    other => other?,
                }
                txn.delete(&keys::kb_slug(&current.slug)).await?;
                config.slug = new_slug.to_string();
            }
            _ => config.slug = current.slug,
        }
        if config.migration_version < current.migration_version {
            config.migration_version = current.migration_version;
        }

        kv::set_record(txn, &keys::kb_config(kbid), &config).await?;
        debug!(kbid, "Updated knowledge box");
        Ok(kbid.to_string())
    }

    /// Remove every record of the KB; returns its last config
    pub async fn delete(txn: &mut dyn Transaction, kbid: &str) -> Result<KnowledgeBoxConfig> {
        let config = Self::get_config(txn, kbid)
            .await?
            .ok_or_else(|| AtlasError::KnowledgeBoxNotFound(kbid.to_string()))?;
        let removed = kv::delete_prefix(txn, &keys::kb_prefix(kbid)).await?;
        txn.delete(&keys::kb_slug(&config.slug)).await?;
        txn.delete(&keys::kb_migration(kbid)).await?;
        info!(kbid, slug = %config.slug, removed, "Deleted knowledge box");
        Ok(config)
    }

    /// `(slug, kbid)` pairs whose slug starts with `prefix`
    pub async fn list(txn: &mut dyn Transaction, prefix: &str) -> Result<Vec<(String, String)>> {
        let scan = format!("{}{}", keys::KB_SLUGS_PREFIX, prefix);
        let mut result = Vec::new();
        for key in kv::collect_keys(txn, &scan, None).await? {
            let slug = key.trim_start_matches(keys::KB_SLUGS_PREFIX).to_string();
            if let Some(kbid) = txn.get(&key).await? {
                result.push((slug, String::from_utf8_lossy(&kbid).into_owned()));
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub async fn get(&self, txn: &mut dyn Transaction, uuid: &str) -> Result<Option<Resource>> {
        Resource::load(txn, &self.kbid, uuid).await
    }

    pub async fn get_resource_uuid_by_slug(&self, txn: &mut dyn Transaction, slug: &str) -> Result<Option<String>> {
        Ok(txn
            .get(&keys::resource_slug(&self.kbid, slug))
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Create the resource record; the slug mapping is written separately
    /// with `set_resource_slug`
    pub async fn add_resource(
        &self,
        txn: &mut dyn Transaction,
        uuid: &str,
        slug: &str,
        basic: Option<&Basic>,
    ) -> Result<Resource> {
        let mut initial = basic.cloned().unwrap_or_default();
        initial.slug = if slug.is_empty() { uuid.to_string() } else { slug.to_string() };
        let now = now_secs();
        if initial.created == 0 {
            initial.created = now;
        }
        if initial.modified == 0 {
            initial.modified = now;
        }
        Resource::create(txn, &self.kbid, uuid, initial).await
    }

    pub async fn set_resource_slug(&self, txn: &mut dyn Transaction, slug: &str, uuid: &str) -> Result<()> {
        txn.set(&keys::resource_slug(&self.kbid, slug), Bytes::from(uuid.to_string()))
            .await
    }

    /// Remove the resource and its slug mapping
    /// Delete the resource's records. Without a basic record only the keys
    /// under the resource prefix are left to remove.
    pub async fn delete_resource(&self, txn: &mut dyn Transaction, uuid: &str) -> Result<()> {
        let Some(resource) = self.get(txn, uuid).await? else {
            kv::delete_prefix(txn, &keys::resource_prefix(&self.kbid, uuid)).await?;
            return Ok(());
        };
        let slug = resource.slug().to_string();
        resource.delete(txn).await?;
        if !slug.is_empty() {
            let key = keys::resource_slug(&self.kbid, &slug);
            let owner = txn.get(&key).await?;
            if owner.as_deref() == Some(uuid.as_bytes()) {
                txn.delete(&key).await?;
            }
        }
        Ok(())
    }

    pub async fn get_resource_shard_id(&self, txn: &mut dyn Transaction, uuid: &str) -> Result<Option<String>> {
        Ok(txn
            .get(&keys::resource_shard(&self.kbid, uuid))
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub async fn set_resource_shard_id(&self, txn: &mut dyn Transaction, uuid: &str, shard: &str) -> Result<()> {
        txn.set(&keys::resource_shard(&self.kbid, uuid), Bytes::from(shard.to_string()))
            .await
    }

    /// Uuids of every resource in the KB
    pub async fn resource_uuids(&self, txn: &mut dyn Transaction) -> Result<Vec<String>> {
        let prefix = keys::resources_prefix(&self.kbid);
        Ok(kv::collect_keys(txn, &prefix, None)
            .await?
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }
}
