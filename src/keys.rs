//! KV key namespace
//!
//! Every key the crate reads or writes is built here.
//!
//! ```text
//! /kbs/{kbid}/config                          KnowledgeBoxConfig
//! /kbs/{kbid}/shards                          KbShards
//! /kbs/{kbid}/s/{slug}                        resource uuid
//! /kbs/{kbid}/r/{uuid}                        Basic
//! /kbs/{kbid}/r/{uuid}/origin                 Origin
//! /kbs/{kbid}/r/{uuid}/security               Security
//! /kbs/{kbid}/r/{uuid}/allfields              Vec<FieldId>
//! /kbs/{kbid}/r/{uuid}/shard                  logical shard id
//! /kbs/{kbid}/r/{uuid}/f/{type}/{field}       FieldValue
//! /kbs/{kbid}/r/{uuid}/f/{type}/{field}/...   extracted artifacts
//! /kbslugs/{slug}                             kbid
//! /ingest/partitions/{partition}/last_seqid   i64
//! /distributed/locks/{name}                   LockRecord
//! migrations/{kbid}                           pending migration marker
//! migration/info                              GlobalMigrationInfo
//! ```

use crate::model::FieldId;

pub const KB_SLUGS_PREFIX: &str = "/kbslugs/";
pub const LOCKS_PREFIX: &str = "/distributed/locks/";
pub const MIGRATIONS_PREFIX: &str = "migrations/";
pub const MIGRATION_INFO: &str = "migration/info";

// =============================================================================
// Knowledge Boxes
// =============================================================================

pub fn kb_prefix(kbid: &str) -> String {
    format!("/kbs/{}/", kbid)
}

pub fn kb_config(kbid: &str) -> String {
    format!("/kbs/{}/config", kbid)
}

pub fn kb_shards(kbid: &str) -> String {
    format!("/kbs/{}/shards", kbid)
}

pub fn kb_slug(slug: &str) -> String {
    format!("{}{}", KB_SLUGS_PREFIX, slug)
}

// =============================================================================
// Resources
// =============================================================================

pub fn resource_slug(kbid: &str, slug: &str) -> String {
    format!("/kbs/{}/s/{}", kbid, slug)
}

pub fn resource_slugs_prefix(kbid: &str) -> String {
    format!("/kbs/{}/s/", kbid)
}

pub fn resources_prefix(kbid: &str) -> String {
    format!("/kbs/{}/r/", kbid)
}

pub fn resource_basic(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{}/r/{}", kbid, uuid)
}

/// Everything stored under a resource, except its basic record
pub fn resource_prefix(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{}/r/{}/", kbid, uuid)
}

pub fn resource_origin(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{}/r/{}/origin", kbid, uuid)
}

pub fn resource_security(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{}/r/{}/security", kbid, uuid)
}

pub fn resource_all_fields(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{}/r/{}/allfields", kbid, uuid)
}

pub fn resource_shard(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{}/r/{}/shard", kbid, uuid)
}

// =============================================================================
// Fields
// =============================================================================

pub fn field_prefix(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("/kbs/{}/r/{}/f/{}/{}/", kbid, uuid, field.field_type.abbrev(), field.field)
}

pub fn field_value(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("/kbs/{}/r/{}/f/{}/{}", kbid, uuid, field.field_type.abbrev(), field.field)
}

pub fn field_extracted_text(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("{}extracted_text", field_prefix(kbid, uuid, field))
}

pub fn field_metadata(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("{}metadata", field_prefix(kbid, uuid, field))
}

pub fn field_errors(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("{}errors", field_prefix(kbid, uuid, field))
}

pub fn field_vectors(kbid: &str, uuid: &str, field: &FieldId, vectorset: &str) -> String {
    format!("{}vectors/{}", field_prefix(kbid, uuid, field), vectorset)
}

// =============================================================================
// Ingest Bookkeeping
// =============================================================================

pub fn partition_last_seqid(partition: &str) -> String {
    format!("/ingest/partitions/{}/last_seqid", partition)
}

pub fn lock(name: &str) -> String {
    format!("{}{}", LOCKS_PREFIX, name)
}

pub fn kb_migration(kbid: &str) -> String {
    format!("{}{}", MIGRATIONS_PREFIX, kbid)
}
