use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::HarvestStore;
use crate::error::{HarvestError, Result};
use crate::models::{
    external_id, HarvestRun, HarvestSource, HarvestedRecordLink, LocalObject, NewObject,
    ObjectUpdate, RunCounts, RunOutcome, SourceDefinition, SourceStatus,
};

/// PostgreSQL implementation of [`HarvestStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Serialize writers of one record until the transaction ends.
async fn lock_record<'e, E>(executor: E, source_id: &str, oai_identifier: &str) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(external_id(source_id, oai_identifier))
        .execute(executor)
        .await?;
    Ok(())
}

/// Serialize claims on one handle, across sources, until the transaction ends.
async fn lock_handle<'e, E>(executor: E, handle: &str) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 1))")
        .bind(handle)
        .execute(executor)
        .await?;
    Ok(())
}

async fn fetch_link<'e, E>(
    executor: E,
    source_id: &str,
    oai_identifier: &str,
) -> Result<Option<HarvestedRecordLink>>
where
    E: sqlx::PgExecutor<'e>,
{
    let link = sqlx::query_as::<_, HarvestedRecordLink>(
        r#"
        SELECT * FROM harvested_record_links
        WHERE source_id = $1 AND oai_identifier = $2
        "#,
    )
    .bind(source_id)
    .bind(oai_identifier)
    .fetch_optional(executor)
    .await?;
    Ok(link)
}

fn link_not_found(source_id: &str, oai_identifier: &str) -> HarvestError {
    HarvestError::LinkNotFound {
        source_id: source_id.to_string(),
        oai_identifier: oai_identifier.to_string(),
    }
}

#[async_trait]
impl HarvestStore for PgStore {
    #[tracing::instrument(skip(self, definition), fields(source_id = %definition.source_id))]
    async fn upsert_source(&self, definition: &SourceDefinition) -> Result<HarvestSource> {
        let source = sqlx::query_as::<_, HarvestSource>(
            r#"
            INSERT INTO harvest_sources
                (source_id, base_url, set_spec, collection, metadata_format, harvest_mode)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_id) DO UPDATE SET
                base_url = EXCLUDED.base_url,
                set_spec = EXCLUDED.set_spec,
                collection = EXCLUDED.collection,
                metadata_format = EXCLUDED.metadata_format,
                harvest_mode = EXCLUDED.harvest_mode,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(&definition.source_id)
        .bind(&definition.base_url)
        .bind(&definition.set_spec)
        .bind(&definition.collection)
        .bind(&definition.metadata_format)
        .bind(definition.harvest_mode)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("source upserted");
        Ok(source)
    }

    async fn get_source(&self, source_id: &str) -> Result<HarvestSource> {
        sqlx::query_as::<_, HarvestSource>("SELECT * FROM harvest_sources WHERE source_id = $1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HarvestError::SourceNotFound(source_id.to_string()))
    }

    async fn list_sources(&self) -> Result<Vec<HarvestSource>> {
        let sources =
            sqlx::query_as::<_, HarvestSource>("SELECT * FROM harvest_sources ORDER BY source_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(sources)
    }

    #[tracing::instrument(skip(self))]
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

        let updated = sqlx::query_as::<_, HarvestSource>(
            r#"
            UPDATE harvest_sources
            SET status = $2, updated_at = now()
            WHERE source_id = $1 AND status <> 'busy'
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(source) => Ok(source),
            None => {
                // Either missing or busy; tell them apart.
                let source = self.get_source(source_id).await?;
                Err(HarvestError::SourceBusy(source.source_id))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn claim_source(&self, source_id: &str) -> Result<Option<HarvestSource>> {
        let source = sqlx::query_as::<_, HarvestSource>(
            r#"
            UPDATE harvest_sources
            SET status = 'busy', last_attempt_at = now(), updated_at = now()
            WHERE source_id = $1 AND status IN ('ready', 'queue', 'orphaned')
            RETURNING *
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        if source.is_some() {
            tracing::debug!("source claimed");
        }
        Ok(source)
    }

    #[tracing::instrument(skip(self, message))]
    async fn release_source(
        &self,
        source_id: &str,
        outcome: RunOutcome,
        harvest_started_at: DateTime<Utc>,
        message: Option<&str>,
    ) -> Result<HarvestSource> {
        sqlx::query_as::<_, HarvestSource>(
            r#"
            UPDATE harvest_sources
            SET status = 'ready',
                last_outcome = $2,
                last_harvest_at = CASE
                    WHEN $4 AND (reset_at IS NULL OR reset_at <= $3) THEN $3
                    ELSE last_harvest_at
                END,
                last_message = $5,
                updated_at = now()
            WHERE source_id = $1 AND status = 'busy'
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(outcome)
        .bind(harvest_started_at)
        .bind(outcome.advances_harvest_date())
        .bind(message)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HarvestError::InvalidInput(format!("source {source_id} is not busy")))
    }

    #[tracing::instrument(skip(self))]
    async fn reset_harvest_dates(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE harvest_sources
            SET last_harvest_at = NULL,
                last_attempt_at = NULL,
                reset_at = $1,
                updated_at = now()
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            WITH closed AS (
                UPDATE harvest_runs
                SET outcome = 'aborted',
                    finished_at = now(),
                    cursor = NULL,
                    message = 'interrupted: the worker running this harvest stopped'
                WHERE outcome IS NULL
                RETURNING source_id
            )
            UPDATE harvest_sources
            SET status = 'orphaned', updated_at = now()
            WHERE status = 'busy' OR source_id IN (SELECT source_id FROM closed)
            RETURNING source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            tracing::warn!(sources = ?ids, "recovered interrupted harvests");
        }
        Ok(ids)
    }

    #[tracing::instrument(skip(self))]
    async fn create_run(&self, source_id: &str, started_at: DateTime<Utc>) -> Result<HarvestRun> {
        let result = sqlx::query_as::<_, HarvestRun>(
            r#"
            INSERT INTO harvest_runs (source_id, started_at)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(run) => Ok(run),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(HarvestError::SourceBusy(source_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_run_progress(
        &self,
        run_id: Uuid,
        cursor: Option<&str>,
        counts: &RunCounts,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE harvest_runs
            SET cursor = $2,
                records_processed = $3, records_created = $4, records_updated = $5,
                records_tombstoned = $6, records_skipped = $7, records_rejected = $8,
                records_failed = $9
            WHERE id = $1 AND outcome IS NULL
            "#,
        )
        .bind(run_id)
        .bind(cursor)
        .bind(counts.processed)
        .bind(counts.created)
        .bind(counts.updated)
        .bind(counts.tombstoned)
        .bind(counts.skipped)
        .bind(counts.rejected)
        .bind(counts.failed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HarvestError::RunNotFound(run_id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, counts, message))]
    async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        counts: &RunCounts,
        message: Option<&str>,
    ) -> Result<HarvestRun> {
        let run = sqlx::query_as::<_, HarvestRun>(
            r#"
            UPDATE harvest_runs
            SET outcome = $2, finished_at = now(), cursor = NULL,
                records_processed = $3, records_created = $4, records_updated = $5,
                records_tombstoned = $6, records_skipped = $7, records_rejected = $8,
                records_failed = $9, message = $10
            WHERE id = $1 AND outcome IS NULL
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(outcome)
        .bind(counts.processed)
        .bind(counts.created)
        .bind(counts.updated)
        .bind(counts.tombstoned)
        .bind(counts.skipped)
        .bind(counts.rejected)
        .bind(counts.failed)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        match run {
            Some(run) => Ok(run),
            None => {
                let existing = self.get_run(run_id).await?;
                Err(HarvestError::InvalidInput(format!(
                    "run {} already finished",
                    existing.id
                )))
            }
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<HarvestRun> {
        sqlx::query_as::<_, HarvestRun>("SELECT * FROM harvest_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(HarvestError::RunNotFound(run_id))
    }

    async fn list_runs(&self, source_id: &str) -> Result<Vec<HarvestRun>> {
        let runs = sqlx::query_as::<_, HarvestRun>(
            "SELECT * FROM harvest_runs WHERE source_id = $1 ORDER BY started_at DESC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    async fn find_link(
        &self,
        source_id: &str,
        oai_identifier: &str,
    ) -> Result<Option<HarvestedRecordLink>> {
        fetch_link(&self.pool, source_id, oai_identifier).await
    }

    async fn find_object_by_external_id(&self, external_id: &str) -> Result<Option<LocalObject>> {
        let object =
            sqlx::query_as::<_, LocalObject>("SELECT * FROM local_objects WHERE external_id = $1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(object)
    }

    async fn get_object(&self, object_id: Uuid) -> Result<LocalObject> {
        sqlx::query_as::<_, LocalObject>("SELECT * FROM local_objects WHERE id = $1")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HarvestError::Storage(format!("local object {object_id} not found")))
    }

    #[tracing::instrument(skip(self, object), fields(source_id = %object.source_id, oai_identifier = %object.oai_identifier))]
    async fn create_object(&self, object: NewObject) -> Result<(LocalObject, HarvestedRecordLink)> {
        let mut tx = self.pool.begin().await?;
        lock_record(&mut *tx, &object.source_id, &object.oai_identifier).await?;

        if fetch_link(&mut *tx, &object.source_id, &object.oai_identifier)
            .await?
            .is_some()
        {
            return Err(HarvestError::DuplicateLink {
                source_id: object.source_id,
                oai_identifier: object.oai_identifier,
            });
        }

        if let Some(handle) = &object.handle {
            lock_handle(&mut *tx, handle).await?;
            let holder = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM local_objects WHERE handle = $1",
            )
            .bind(handle)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(existing) = holder {
                return Err(HarvestError::HandleCollision {
                    handle: handle.clone(),
                    existing,
                });
            }
        }

        let local = sqlx::query_as::<_, LocalObject>(
            r#"
            INSERT INTO local_objects
                (collection, external_id, handle, metadata, ore_document, content_links)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&object.collection)
        .bind(external_id(&object.source_id, &object.oai_identifier))
        .bind(&object.handle)
        .bind(Json(&object.metadata))
        .bind(&object.ore_document)
        .bind(Json(&object.content_links))
        .fetch_one(&mut *tx)
        .await?;

        let link = sqlx::query_as::<_, HarvestedRecordLink>(
            r#"
            INSERT INTO harvested_record_links
                (source_id, oai_identifier, object_id, remote_datestamp, content_hash)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&object.source_id)
        .bind(&object.oai_identifier)
        .bind(local.id)
        .bind(&object.remote_datestamp)
        .bind(&object.content_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(object_id = %local.id, "local object created");
        Ok((local, link))
    }

    #[tracing::instrument(skip(self, update))]
    async fn update_object_metadata(
        &self,
        source_id: &str,
        oai_identifier: &str,
        update: ObjectUpdate,
    ) -> Result<(LocalObject, HarvestedRecordLink)> {
        let mut tx = self.pool.begin().await?;
        lock_record(&mut *tx, source_id, oai_identifier).await?;

        let link = fetch_link(&mut *tx, source_id, oai_identifier)
            .await?
            .ok_or_else(|| link_not_found(source_id, oai_identifier))?;

        let local = sqlx::query_as::<_, LocalObject>(
            r#"
            UPDATE local_objects
            SET metadata = $2, ore_document = $3, content_links = $4,
                withdrawn = false, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(link.object_id)
        .bind(Json(&update.metadata))
        .bind(&update.ore_document)
        .bind(Json(&update.content_links))
        .fetch_one(&mut *tx)
        .await?;

        let link = sqlx::query_as::<_, HarvestedRecordLink>(
            r#"
            UPDATE harvested_record_links
            SET remote_datestamp = $2, content_hash = $3, tombstoned = false, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(link.id)
        .bind(&update.remote_datestamp)
        .bind(&update.content_hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((local, link))
    }

    #[tracing::instrument(skip(self))]
    async fn mark_withdrawn(
        &self,
        source_id: &str,
        oai_identifier: &str,
        remote_datestamp: &str,
    ) -> Result<HarvestedRecordLink> {
        let mut tx = self.pool.begin().await?;
        lock_record(&mut *tx, source_id, oai_identifier).await?;

        let link = sqlx::query_as::<_, HarvestedRecordLink>(
            r#"
            UPDATE harvested_record_links
            SET tombstoned = true, remote_datestamp = $3, updated_at = now()
            WHERE source_id = $1 AND oai_identifier = $2
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(oai_identifier)
        .bind(remote_datestamp)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| link_not_found(source_id, oai_identifier))?;

        sqlx::query("UPDATE local_objects SET withdrawn = true, updated_at = now() WHERE id = $1")
            .bind(link.object_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(link)
    }

    async fn count_links(&self, source_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM harvested_record_links WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
