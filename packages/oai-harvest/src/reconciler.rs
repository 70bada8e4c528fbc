//! Maps incoming OAI records onto local objects.
//!
//! The decision for one record depends only on its existing link:
//!
//! | link                 | remote says | outcome            |
//! |----------------------|-------------|--------------------|
//! | none                 | live        | create             |
//! | none                 | deleted     | skip               |
//! | present, older stamp | live        | update             |
//! | present, same stamp  | live        | skip               |
//! | present, live        | deleted     | withdraw           |
//! | present, tombstoned  | deleted     | skip               |
//!
//! Repeating a window therefore only produces skips.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::config::HandlePolicy;
use crate::crosswalk::extract_handle;
use crate::error::{HarvestError, Result};
use crate::models::{HarvestSource, MetadataValue, NewObject, ObjectUpdate};
use crate::store::HarvestStore;
use crate::validator::ValidatedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Tombstoned,
    SkippedUnchanged,
}

/// State shared by the records of one run, dropped with the run.
#[derive(Debug)]
pub struct RunContext {
    pub source: HarvestSource,
    /// Start time of the run; stamped into provenance.
    pub harvested_at: DateTime<Utc>,
    pub handle_policy: HandlePolicy,
    /// Handles assigned during this run.
    assigned_handles: HashMap<String, Uuid>,
}

impl RunContext {
    pub fn new(source: HarvestSource, harvested_at: DateTime<Utc>, handle_policy: HandlePolicy) -> Self {
        Self {
            source,
            harvested_at,
            handle_policy,
            assigned_handles: HashMap::new(),
        }
    }
}

/// Content of a live record, ready to store.
#[derive(Debug, Clone)]
pub struct RecordContent {
    pub validated: ValidatedRecord,
    pub ore_document: Option<String>,
    pub content_links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub oai_identifier: String,
    pub remote_datestamp: String,
    pub is_deleted: bool,
    /// Required unless the record is deleted.
    pub content: Option<RecordContent>,
}

/// SHA-256 of a metadata payload, lowercase hex.
#[must_use]
pub fn content_hash(payload: &str) -> String {
    Sha256::digest(payload.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Whether `remote` is strictly newer than `stored`.
///
/// Datestamps of different granularity are compared as instants; unparseable
/// values fall back to string order, which matches ISO 8601.
#[must_use]
pub fn is_newer(remote: &str, stored: &str) -> bool {
    use oai_client::config::parse_datestamp;
    match (parse_datestamp(remote), parse_datestamp(stored)) {
        (Ok(r), Ok(s)) => r > s,
        _ => remote.trim() > stored.trim(),
    }
}

fn provenance(ctx: &RunContext, oai_identifier: &str, hash: &str) -> MetadataValue {
    let mut value = MetadataValue::new(
        "dc",
        "description",
        Some("provenance"),
        format!(
            "Harvested from {} on {} (OAI identifier {oai_identifier}, metadata sha256 {hash})",
            ctx.source.base_url,
            ctx.harvested_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
    );
    value.language = Some("en".to_string());
    value
}

/// Reconcile one record with the local store.
#[tracing::instrument(skip(store, ctx, record), fields(source_id = %ctx.source.source_id, oai_identifier = %record.oai_identifier))]
pub async fn reconcile<S>(
    store: &S,
    ctx: &mut RunContext,
    record: IncomingRecord,
) -> Result<ReconcileOutcome>
where
    S: HarvestStore + ?Sized,
{
    let source_id = ctx.source.source_id.clone();
    let link = store.find_link(&source_id, &record.oai_identifier).await?;

    if record.is_deleted {
        return match link {
            Some(link) if !link.tombstoned => {
                store
                    .mark_withdrawn(&source_id, &record.oai_identifier, &record.remote_datestamp)
                    .await?;
                tracing::debug!(object_id = %link.object_id, "object withdrawn");
                Ok(ReconcileOutcome::Tombstoned)
            }
            _ => Ok(ReconcileOutcome::SkippedUnchanged),
        };
    }

    let content = record.content.ok_or_else(|| {
        HarvestError::InvalidInput(format!("live record {} without content", record.oai_identifier))
    })?;
    let hash = content_hash(&content.validated.payload);

    match link {
        None => {
            let handle = extract_handle(&content.validated.metadata, &ctx.handle_policy);
            if let Some(h) = &handle {
                if let Some(existing) = ctx.assigned_handles.get(h) {
                    return Err(HarvestError::HandleCollision {
                        handle: h.clone(),
                        existing: *existing,
                    });
                }
            }

            let mut metadata = content.validated.metadata;
            metadata.push(provenance(ctx, &record.oai_identifier, &hash));

            let (object, _) = store
                .create_object(NewObject {
                    source_id,
                    oai_identifier: record.oai_identifier,
                    collection: ctx.source.collection.clone(),
                    handle: handle.clone(),
                    metadata,
                    ore_document: content.ore_document,
                    content_links: content.content_links,
                    remote_datestamp: record.remote_datestamp,
                    content_hash: hash,
                })
                .await?;

            if let Some(h) = handle {
                ctx.assigned_handles.insert(h, object.id);
            }
            tracing::debug!(object_id = %object.id, "object created");
            Ok(ReconcileOutcome::Created)
        }
        Some(link) if !is_newer(&record.remote_datestamp, &link.remote_datestamp) => {
            Ok(ReconcileOutcome::SkippedUnchanged)
        }
        Some(link) => {
            let existing = store.get_object(link.object_id).await?;
            let mut metadata = content.validated.metadata;
            metadata.extend(
                existing
                    .metadata
                    .0
                    .into_iter()
                    .filter(|v| v.field_name() == "dc.description.provenance"),
            );
            metadata.push(provenance(ctx, &record.oai_identifier, &hash));

            store
                .update_object_metadata(
                    &source_id,
                    &record.oai_identifier,
                    ObjectUpdate {
                        metadata,
                        ore_document: content.ore_document,
                        content_links: content.content_links,
                        remote_datestamp: record.remote_datestamp,
                        content_hash: hash,
                    },
                )
                .await?;
            tracing::debug!(object_id = %link.object_id, "object updated");
            Ok(ReconcileOutcome::Updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceDefinition;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    const PAYLOAD: &str = r#"<oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>T</dc:title></oai_dc:dc>"#;

    async fn setup() -> (MemoryStore, RunContext) {
        let store = MemoryStore::new();
        let source = store
            .upsert_source(&SourceDefinition::new("src", "http://remote/oai", "col", "dc"))
            .await
            .unwrap();
        let ctx = RunContext::new(source, Utc::now(), HandlePolicy::default());
        (store, ctx)
    }

    fn live(id: &str, datestamp: &str, title: &str, handle: Option<&str>) -> IncomingRecord {
        let mut metadata = vec![MetadataValue::new("dc", "title", None, title)];
        if let Some(h) = handle {
            metadata.push(MetadataValue::new(
                "dc",
                "identifier",
                Some("uri"),
                format!("http://hdl.handle.net/{h}"),
            ));
        }
        IncomingRecord {
            oai_identifier: id.into(),
            remote_datestamp: datestamp.into(),
            is_deleted: false,
            content: Some(RecordContent {
                validated: ValidatedRecord {
                    payload: format!("{PAYLOAD}<!-- {title} -->"),
                    metadata,
                },
                ore_document: None,
                content_links: vec![],
            }),
        }
    }

    fn deleted(id: &str, datestamp: &str) -> IncomingRecord {
        IncomingRecord {
            oai_identifier: id.into(),
            remote_datestamp: datestamp.into(),
            is_deleted: true,
            content: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (store, mut ctx) = setup().await;

        let outcome = reconcile(&store, &mut ctx, live("oai:1", "2024-01-01T00:00:00Z", "v1", Some("10.5/1")))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);

        let outcome = reconcile(&store, &mut ctx, live("oai:1", "2024-01-01T00:00:00Z", "v1", Some("10.5/1")))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::SkippedUnchanged);

        let outcome = reconcile(&store, &mut ctx, live("oai:1", "2024-02-01T00:00:00Z", "v2", Some("10.5/1")))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);

        let object = store
            .find_object_by_external_id("src::oai:1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(object.values("dc.title").collect::<Vec<_>>(), vec!["v2"]);
        assert_eq!(object.values("dc.description.provenance").count(), 2);
        assert_eq!(object.handle.as_deref(), Some("10.5/1"));

        let outcome = reconcile(&store, &mut ctx, deleted("oai:1", "2024-03-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Tombstoned);
        assert!(store.get_object(object.id).await.unwrap().withdrawn);

        let outcome = reconcile(&store, &mut ctx, deleted("oai:1", "2024-03-01T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::SkippedUnchanged);
        assert_eq!(store.count_links("src").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deleted_without_link_is_skipped() {
        let (store, mut ctx) = setup().await;
        let outcome = reconcile(&store, &mut ctx, deleted("oai:never-seen", "2024-01-01"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::SkippedUnchanged);
        assert_eq!(store.count_links("src").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reappearing_record_is_reinstated() {
        let (store, mut ctx) = setup().await;
        reconcile(&store, &mut ctx, live("oai:1", "2024-01-01", "v1", None))
            .await
            .unwrap();
        reconcile(&store, &mut ctx, deleted("oai:1", "2024-01-02"))
            .await
            .unwrap();
        let outcome = reconcile(&store, &mut ctx, live("oai:1", "2024-01-03", "v3", None))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);

        let link = store.find_link("src", "oai:1").await.unwrap().unwrap();
        assert!(!link.tombstoned);
        assert!(!store.get_object(link.object_id).await.unwrap().withdrawn);
    }

    #[tokio::test]
    async fn test_handle_collision_within_run() {
        let (store, mut ctx) = setup().await;
        reconcile(&store, &mut ctx, live("oai:1", "2024-01-01", "a", Some("10.5/9")))
            .await
            .unwrap();
        let err = reconcile(&store, &mut ctx, live("oai:2", "2024-01-01", "b", Some("10.5/9")))
            .await
            .unwrap_err();
        assert!(err.is_record_level());
        assert_eq!(store.count_links("src").await.unwrap(), 1);
    }

    #[test]
    fn test_is_newer_across_granularities() {
        assert!(is_newer("2024-01-02", "2024-01-01T23:59:59Z"));
        assert!(!is_newer("2024-01-01T00:00:00Z", "2024-01-01"));
        assert!(!is_newer("2023-12-31T00:00:00Z", "2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
