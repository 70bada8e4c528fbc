//! Storage contract of the harvest engine.
//!
//! Record writes are keyed by `(source_id, oai_identifier)` and each one is
//! atomic: a failure leaves no half-written object behind. Implementations
//! serialize writes for the same key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    HarvestRun, HarvestSource, HarvestedRecordLink, LocalObject, NewObject, ObjectUpdate,
    RunCounts, RunOutcome, SourceDefinition, SourceStatus,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait HarvestStore: Send + Sync {
    /// Insert or update a source definition. Runtime state is left alone.
    async fn upsert_source(&self, definition: &SourceDefinition) -> Result<HarvestSource>;

    async fn get_source(&self, source_id: &str) -> Result<HarvestSource>;

    async fn list_sources(&self) -> Result<Vec<HarvestSource>>;

    /// Operator status change (queue, disable, re-enable).
    ///
    /// A source that is BUSY keeps that status; the new one is refused.
    async fn set_source_status(&self, source_id: &str, status: SourceStatus)
        -> Result<HarvestSource>;

    /// Take the source lock: READY, QUEUE or ORPHANED becomes BUSY and the
    /// attempt time is recorded. `None` if the source is not claimable.
    async fn claim_source(&self, source_id: &str) -> Result<Option<HarvestSource>>;

    /// Give the source lock back after a run.
    ///
    /// `harvest_started_at` is stored as the new last-harvest time when the
    /// outcome advances it.
    async fn release_source(
        &self,
        source_id: &str,
        outcome: RunOutcome,
        harvest_started_at: DateTime<Utc>,
        message: Option<&str>,
    ) -> Result<HarvestSource>;

    /// Forget every source's last-harvest and last-attempt time. Runs already in
    /// flight finish without recording a harvest date. Returns the number of sources.
    async fn reset_harvest_dates(&self) -> Result<u64>;

    /// Close runs left open by a dead process as ABORTED and mark their
    /// sources ORPHANED. Returns the affected source ids.
    async fn recover_interrupted(&self) -> Result<Vec<String>>;

    /// Open a run. Fails with `SourceBusy` if the source already has one.
    async fn create_run(&self, source_id: &str, started_at: DateTime<Utc>) -> Result<HarvestRun>;

    async fn record_run_progress(
        &self,
        run_id: Uuid,
        cursor: Option<&str>,
        counts: &RunCounts,
    ) -> Result<()>;

    /// Close a run; the cursor is cleared.
    async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        counts: &RunCounts,
        message: Option<&str>,
    ) -> Result<HarvestRun>;

    async fn get_run(&self, run_id: Uuid) -> Result<HarvestRun>;

    /// Runs of a source, newest first.
    async fn list_runs(&self, source_id: &str) -> Result<Vec<HarvestRun>>;

    async fn find_link(
        &self,
        source_id: &str,
        oai_identifier: &str,
    ) -> Result<Option<HarvestedRecordLink>>;

    async fn find_object_by_external_id(&self, external_id: &str) -> Result<Option<LocalObject>>;

    async fn get_object(&self, object_id: Uuid) -> Result<LocalObject>;

    /// Create the object and its link together.
    ///
    /// Fails with `DuplicateLink` if the key is already linked and with
    /// `HandleCollision` if the handle belongs to another object.
    async fn create_object(&self, object: NewObject) -> Result<(LocalObject, HarvestedRecordLink)>;

    /// Replace the linked object's content and advance the link's datestamp.
    /// A withdrawn object is reinstated.
    async fn update_object_metadata(
        &self,
        source_id: &str,
        oai_identifier: &str,
        update: ObjectUpdate,
    ) -> Result<(LocalObject, HarvestedRecordLink)>;

    /// Withdraw the linked object and tombstone the link. Nothing is deleted.
    async fn mark_withdrawn(
        &self,
        source_id: &str,
        oai_identifier: &str,
        remote_datestamp: &str,
    ) -> Result<HarvestedRecordLink>;

    async fn count_links(&self, source_id: &str) -> Result<i64>;
}
