use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::HarvestStore;
use crate::error::{HarvestError, Result};
use crate::models::{
    external_id, HarvestRun, HarvestSource, HarvestedRecordLink, LocalObject, NewObject,
    ObjectUpdate, RunCounts, RunOutcome, SourceDefinition, SourceStatus,
};

#[derive(Default)]
struct Inner {
    sources: BTreeMap<String, HarvestSource>,
    runs: Vec<HarvestRun>,
    objects: HashMap<Uuid, LocalObject>,
    /// Object ids in creation order.
    created: Vec<Uuid>,
    links: HashMap<(String, String), HarvestedRecordLink>,
    failing_records: HashSet<String>,
}

/// In-memory [`HarvestStore`].
///
/// One mutex guards all state, so every operation is atomic. Record writes
/// for identifiers registered with [`MemoryStore::fail_writes_for`] fail
/// with a storage error.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make record writes for `oai_identifier` fail as if storage were down.
    pub fn fail_writes_for(&self, oai_identifier: &str) -> Result<()> {
        self.lock()?
            .failing_records
            .insert(oai_identifier.to_string());
        Ok(())
    }

    /// All local objects, in creation order.
    pub fn objects(&self) -> Result<Vec<LocalObject>> {
        let inner = self.lock()?;
        Ok(inner
            .created
            .iter()
            .filter_map(|id| inner.objects.get(id).cloned())
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| HarvestError::Storage("memory store lock poisoned".into()))
    }
}

impl Inner {
    fn source_mut(&mut self, source_id: &str) -> Result<&mut HarvestSource> {
        self.sources
            .get_mut(source_id)
            .ok_or_else(|| HarvestError::SourceNotFound(source_id.to_string()))
    }

    fn run_mut(&mut self, run_id: Uuid) -> Result<&mut HarvestRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(HarvestError::RunNotFound(run_id))
    }

    fn check_writable(&self, oai_identifier: &str) -> Result<()> {
        if self.failing_records.contains(oai_identifier) {
            return Err(HarvestError::Storage(format!(
                "write rejected for {oai_identifier}"
            )));
        }
        Ok(())
    }

    fn link_key(source_id: &str, oai_identifier: &str) -> (String, String) {
        (source_id.to_string(), oai_identifier.to_string())
    }
}

fn apply_counts(run: &mut HarvestRun, counts: &RunCounts) {
    run.records_processed = counts.processed;
    run.records_created = counts.created;
    run.records_updated = counts.updated;
    run.records_tombstoned = counts.tombstoned;
    run.records_skipped = counts.skipped;
    run.records_rejected = counts.rejected;
    run.records_failed = counts.failed;
}

fn link_not_found(source_id: &str, oai_identifier: &str) -> HarvestError {
    HarvestError::LinkNotFound {
        source_id: source_id.to_string(),
        oai_identifier: oai_identifier.to_string(),
    }
}

#[async_trait]
impl HarvestStore for MemoryStore {
    async fn upsert_source(&self, definition: &SourceDefinition) -> Result<HarvestSource> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let source = inner
            .sources
            .entry(definition.source_id.clone())
            .and_modify(|s| {
                s.base_url = definition.base_url.clone();
                s.set_spec = definition.set_spec.clone();
                s.collection = definition.collection.clone();
                s.metadata_format = definition.metadata_format.clone();
                s.harvest_mode = definition.harvest_mode;
                s.updated_at = now;
            })
            .or_insert_with(|| HarvestSource {
                source_id: definition.source_id.clone(),
                base_url: definition.base_url.clone(),
                set_spec: definition.set_spec.clone(),
                collection: definition.collection.clone(),
                metadata_format: definition.metadata_format.clone(),
                harvest_mode: definition.harvest_mode,
                status: SourceStatus::Ready,
                last_harvest_at: None,
                last_outcome: None,
                last_attempt_at: None,
                last_message: None,
                reset_at: None,
                created_at: now,
                updated_at: now,
            });
        Ok(source.clone())
    }

    async fn get_source(&self, source_id: &str) -> Result<HarvestSource> {
        let mut inner = self.lock()?;
        Ok(inner.source_mut(source_id)?.clone())
    }

    async fn list_sources(&self) -> Result<Vec<HarvestSource>> {
        Ok(self.lock()?.sources.values().cloned().collect())
    }

    async fn set_source_status(
        &self,
        source_id: &str,
        status: SourceStatus,
    ) -> Result<HarvestSource> {
        if status == SourceStatus::Busy {
            return Err(HarvestError::InvalidInput(
                "BUSY is only set by claiming a source".into(),
            ));
        }
        let mut inner = self.lock()?;
        let source = inner.source_mut(source_id)?;
        if source.status == SourceStatus::Busy {
            return Err(HarvestError::SourceBusy(source_id.to_string()));
        }
        source.status = status;
        source.updated_at = Utc::now();
        Ok(source.clone())
    }

    async fn claim_source(&self, source_id: &str) -> Result<Option<HarvestSource>> {
        let mut inner = self.lock()?;
        let source = inner.source_mut(source_id)?;
        if !source.status.is_claimable() {
            return Ok(None);
        }
        let now = Utc::now();
        source.status = SourceStatus::Busy;
        source.last_attempt_at = Some(now);
        source.updated_at = now;
        Ok(Some(source.clone()))
    }

    async fn release_source(
        &self,
        source_id: &str,
        outcome: RunOutcome,
        harvest_started_at: DateTime<Utc>,
        message: Option<&str>,
    ) -> Result<HarvestSource> {
        let mut inner = self.lock()?;
        let source = inner.source_mut(source_id)?;
        if source.status != SourceStatus::Busy {
            return Err(HarvestError::InvalidInput(format!(
                "source {source_id} is not busy"
            )));
        }
        source.status = SourceStatus::Ready;
        source.last_outcome = Some(outcome);
        if outcome.advances_harvest_date() && source.accepts_harvest_date(harvest_started_at) {
            source.last_harvest_at = Some(harvest_started_at);
        }
        source.last_message = message.map(str::to_string);
        source.updated_at = Utc::now();
        Ok(source.clone())
    }

    async fn reset_harvest_dates(&self) -> Result<u64> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        for source in inner.sources.values_mut() {
            source.last_harvest_at = None;
            source.last_attempt_at = None;
            source.reset_at = Some(now);
            source.updated_at = now;
        }
        Ok(inner.sources.len() as u64)
    }

    async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut affected: Vec<String> = Vec::new();

        for run in inner.runs.iter_mut().filter(|r| r.outcome.is_none()) {
            run.outcome = Some(RunOutcome::Aborted);
            run.finished_at = Some(now);
            run.cursor = None;
            run.message = Some("interrupted: the worker running this harvest stopped".into());
            affected.push(run.source_id.clone());
        }
        for source in inner.sources.values_mut() {
            if source.status == SourceStatus::Busy || affected.contains(&source.source_id) {
                source.status = SourceStatus::Orphaned;
                source.updated_at = now;
                if !affected.contains(&source.source_id) {
                    affected.push(source.source_id.clone());
                }
            }
        }
        Ok(affected)
    }

    async fn create_run(&self, source_id: &str, started_at: DateTime<Utc>) -> Result<HarvestRun> {
        let mut inner = self.lock()?;
        if inner
            .runs
            .iter()
            .any(|r| r.source_id == source_id && r.outcome.is_none())
        {
            return Err(HarvestError::SourceBusy(source_id.to_string()));
        }
        let run = HarvestRun {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            started_at,
            finished_at: None,
            cursor: None,
            records_processed: 0,
            records_created: 0,
            records_updated: 0,
            records_tombstoned: 0,
            records_skipped: 0,
            records_rejected: 0,
            records_failed: 0,
            outcome: None,
            message: None,
        };
        inner.runs.push(run.clone());
        Ok(run)
    }

    async fn record_run_progress(
        &self,
        run_id: Uuid,
        cursor: Option<&str>,
        counts: &RunCounts,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if run.outcome.is_some() {
            return Err(HarvestError::RunNotFound(run_id));
        }
        run.cursor = cursor.map(str::to_string);
        apply_counts(run, counts);
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        counts: &RunCounts,
        message: Option<&str>,
    ) -> Result<HarvestRun> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if run.outcome.is_some() {
            return Err(HarvestError::InvalidInput(format!(
                "run {run_id} already finished"
            )));
        }
        run.outcome = Some(outcome);
        run.finished_at = Some(Utc::now());
        run.cursor = None;
        run.message = message.map(str::to_string);
        apply_counts(run, counts);
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<HarvestRun> {
        let mut inner = self.lock()?;
        Ok(inner.run_mut(run_id)?.clone())
    }

    async fn list_runs(&self, source_id: &str) -> Result<Vec<HarvestRun>> {
        let inner = self.lock()?;
        let mut runs: Vec<HarvestRun> = inner
            .runs
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn find_link(
        &self,
        source_id: &str,
        oai_identifier: &str,
    ) -> Result<Option<HarvestedRecordLink>> {
        Ok(self
            .lock()?
            .links
            .get(&Inner::link_key(source_id, oai_identifier))
            .cloned())
    }

    async fn find_object_by_external_id(&self, external_id: &str) -> Result<Option<LocalObject>> {
        Ok(self
            .lock()?
            .objects
            .values()
            .find(|o| o.external_id == external_id)
            .cloned())
    }

    async fn get_object(&self, object_id: Uuid) -> Result<LocalObject> {
        self.lock()?
            .objects
            .get(&object_id)
            .cloned()
            .ok_or_else(|| HarvestError::Storage(format!("local object {object_id} not found")))
    }

    async fn create_object(&self, object: NewObject) -> Result<(LocalObject, HarvestedRecordLink)> {
        let mut inner = self.lock()?;
        inner.check_writable(&object.oai_identifier)?;

        let key = Inner::link_key(&object.source_id, &object.oai_identifier);
        if inner.links.contains_key(&key) {
            return Err(HarvestError::DuplicateLink {
                source_id: object.source_id,
                oai_identifier: object.oai_identifier,
            });
        }
        if let Some(handle) = &object.handle {
            if let Some(holder) = inner
                .objects
                .values()
                .find(|o| o.handle.as_deref() == Some(handle.as_str()))
            {
                return Err(HarvestError::HandleCollision {
                    handle: handle.clone(),
                    existing: holder.id,
                });
            }
        }

        let now = Utc::now();
        let local = LocalObject {
            id: Uuid::new_v4(),
            collection: object.collection,
            external_id: external_id(&object.source_id, &object.oai_identifier),
            handle: object.handle,
            metadata: Json(object.metadata),
            ore_document: object.ore_document,
            content_links: Json(object.content_links),
            withdrawn: false,
            created_at: now,
            updated_at: now,
        };
        let link = HarvestedRecordLink {
            id: Uuid::new_v4(),
            source_id: object.source_id,
            oai_identifier: object.oai_identifier,
            object_id: local.id,
            remote_datestamp: object.remote_datestamp,
            content_hash: Some(object.content_hash),
            tombstoned: false,
            created_at: now,
            updated_at: now,
        };
        inner.created.push(local.id);
        inner.objects.insert(local.id, local.clone());
        inner.links.insert(key, link.clone());
        Ok((local, link))
    }

    async fn update_object_metadata(
        &self,
        source_id: &str,
        oai_identifier: &str,
        update: ObjectUpdate,
    ) -> Result<(LocalObject, HarvestedRecordLink)> {
        let mut inner = self.lock()?;
        inner.check_writable(oai_identifier)?;

        let key = Inner::link_key(source_id, oai_identifier);
        let object_id = inner
            .links
            .get(&key)
            .map(|l| l.object_id)
            .ok_or_else(|| link_not_found(source_id, oai_identifier))?;
        let now = Utc::now();

        let local = inner
            .objects
            .get_mut(&object_id)
            .ok_or_else(|| HarvestError::Storage(format!("local object {object_id} not found")))?;
        local.metadata = Json(update.metadata);
        local.ore_document = update.ore_document;
        local.content_links = Json(update.content_links);
        local.withdrawn = false;
        local.updated_at = now;
        let local = local.clone();

        let link = inner
            .links
            .get_mut(&key)
            .ok_or_else(|| link_not_found(source_id, oai_identifier))?;
        link.remote_datestamp = update.remote_datestamp;
        link.content_hash = Some(update.content_hash);
        link.tombstoned = false;
        link.updated_at = now;
        Ok((local, link.clone()))
    }

    async fn mark_withdrawn(
        &self,
        source_id: &str,
        oai_identifier: &str,
        remote_datestamp: &str,
    ) -> Result<HarvestedRecordLink> {
        let mut inner = self.lock()?;
        inner.check_writable(oai_identifier)?;

        let now = Utc::now();
        let link = inner
            .links
            .get_mut(&Inner::link_key(source_id, oai_identifier))
            .ok_or_else(|| link_not_found(source_id, oai_identifier))?;
        link.tombstoned = true;
        link.remote_datestamp = remote_datestamp.to_string();
        link.updated_at = now;
        let link = link.clone();

        if let Some(local) = inner.objects.get_mut(&link.object_id) {
            local.withdrawn = true;
            local.updated_at = now;
        }
        Ok(link)
    }

    async fn count_links(&self, source_id: &str) -> Result<i64> {
        Ok(self
            .lock()?
            .links
            .values()
            .filter(|l| l.source_id == source_id)
            .count() as i64)
    }
}
