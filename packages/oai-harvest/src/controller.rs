//! One harvest run for one source.
//!
//! A run claims its source, asks the repository for its granularity and
//! metadata prefix, then pages through `ListRecords` feeding every record
//! through the validator and the reconciler in the order received. The run
//! ends as:
//!
//! - `COMPLETE`: every page consumed, no record failed.
//! - `COMPLETE_WITH_ERRORS`: every page consumed, some records rejected or
//!   failed. The harvest date still advances.
//! - `FAILED`: transport error, fatal protocol error, storage error or
//!   timeout. The harvest date stays, so the next run covers the same window.
//! - `ABORTED`: cancelled by the operator between records. The cursor is
//!   dropped and the next run starts over from the harvest date.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use oai_client::{ListRecordsRequest, OaiRecord, OaiTransport};
use tokio_util::sync::CancellationToken;

use crate::config::{RunConfig, ValidationProfile};
use crate::crosswalk::{ore_aggregated_links, MetadataFormatRegistry, ORE_ATOM_NAMESPACE};
use crate::error::{HarvestError, Result};
use crate::models::{HarvestMode, HarvestRun, HarvestSource, RunCounts, RunOutcome, SourceStatus};
use crate::reconciler::{reconcile, IncomingRecord, ReconcileOutcome, RecordContent, RunContext};
use crate::report::{RecordFailure, ReportSink, RunReport};
use crate::store::HarvestStore;
use crate::validator::{ValidationResult, Validator};

/// Record failures kept for the report; counts stay exact beyond this.
const MAX_REPORTED_FAILURES: usize = 1000;

/// Counters and failures of the run in progress.
#[derive(Debug, Default)]
pub struct RunAccumulator {
    pub counts: RunCounts,
    pub failures: Vec<RecordFailure>,
}

impl RunAccumulator {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created => self.counts.created += 1,
            ReconcileOutcome::Updated => self.counts.updated += 1,
            ReconcileOutcome::Tombstoned => self.counts.tombstoned += 1,
            ReconcileOutcome::SkippedUnchanged => self.counts.skipped += 1,
        }
    }

    fn reject(&mut self, oai_identifier: &str, reason: String) {
        self.counts.rejected += 1;
        self.push_failure(oai_identifier, "rejected", reason);
    }

    fn fail(&mut self, oai_identifier: &str, error: &HarvestError) {
        self.counts.failed += 1;
        self.push_failure(oai_identifier, "failed", error.to_string());
    }

    fn push_failure(&mut self, oai_identifier: &str, kind: &str, reason: String) {
        if self.failures.len() < MAX_REPORTED_FAILURES {
            self.failures.push(RecordFailure {
                oai_identifier: oai_identifier.to_string(),
                kind: kind.to_string(),
                reason,
            });
        }
    }

    fn outcome(&self) -> RunOutcome {
        if self.counts.errors() > 0 {
            RunOutcome::CompleteWithErrors
        } else {
            RunOutcome::Complete
        }
    }
}

/// Prefixes resolved at run start.
struct Prefixes {
    metadata: String,
    ore: Option<String>,
}

/// Drives harvest runs.
pub struct HarvestController {
    store: Arc<dyn HarvestStore>,
    transport: Arc<dyn OaiTransport>,
    registry: MetadataFormatRegistry,
    profiles: HashMap<String, ValidationProfile>,
    config: RunConfig,
    reports: ReportSink,
}

impl HarvestController {
    pub fn new(store: Arc<dyn HarvestStore>, transport: Arc<dyn OaiTransport>) -> Self {
        Self {
            store,
            transport,
            registry: MetadataFormatRegistry::default(),
            profiles: HashMap::new(),
            config: RunConfig::default(),
            reports: ReportSink::logging(None),
        }
    }

    pub fn with_registry(mut self, registry: MetadataFormatRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_profiles(mut self, profiles: HashMap<String, ValidationProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_run_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_report_sink(mut self, reports: ReportSink) -> Self {
        self.reports = reports;
        self
    }

    pub fn store(&self) -> &Arc<dyn HarvestStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn OaiTransport> {
        &self.transport
    }

    pub fn registry(&self) -> &MetadataFormatRegistry {
        &self.registry
    }

    /// Run one harvest of `source_id` to its end.
    ///
    /// Returns `SourceBusy` without side effects if another run holds the
    /// source, and `SourceDisabled` for disabled sources. Every other failure
    /// ends in a finished run, returned here.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run(&self, source_id: &str, cancel: CancellationToken) -> Result<HarvestRun> {
        let Some(source) = self.store.claim_source(source_id).await? else {
            let source = self.store.get_source(source_id).await?;
            return Err(match source.status {
                SourceStatus::Disabled => HarvestError::SourceDisabled(source.source_id),
                _ => HarvestError::SourceBusy(source.source_id),
            });
        };

        let started_at = Utc::now();
        let run = match self.store.create_run(source_id, started_at).await {
            Ok(run) => run,
            Err(e) => {
                let message = e.to_string();
                if let Err(release_err) = self
                    .store
                    .release_source(source_id, RunOutcome::Failed, started_at, Some(&message))
                    .await
                {
                    tracing::error!(error = %release_err, "failed to release source");
                }
                return Err(e);
            }
        };
        tracing::info!(
            run_id = %run.id,
            base_url = %source.base_url,
            last_harvest = ?source.last_harvest_at,
            mode = %source.harvest_mode,
            "harvest run started"
        );

        let mut ctx = RunContext::new(source.clone(), started_at, self.config.handle_policy.clone());
        let mut acc = RunAccumulator::default();

        let (outcome, error) = match self.execute(&run, &mut ctx, &mut acc, &cancel).await {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "harvest run failed");
                (RunOutcome::Failed, Some(e.to_string()))
            }
        };
        let message = match (&error, outcome) {
            (Some(e), _) => Some(e.clone()),
            (None, RunOutcome::Aborted) => Some("aborted by operator".to_string()),
            _ => None,
        };

        let finished = self
            .store
            .finish_run(run.id, outcome, &acc.counts, message.as_deref())
            .await;
        let released = self
            .store
            .release_source(source_id, outcome, started_at, message.as_deref())
            .await;

        let report = RunReport {
            run_id: run.id,
            source_id: source.source_id.clone(),
            base_url: source.base_url.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            counts: acc.counts,
            failures: acc.failures,
            error: message,
        };
        self.reports.observe(&source, &report).await;

        released?;
        finished
    }

    async fn execute(
        &self,
        run: &HarvestRun,
        ctx: &mut RunContext,
        acc: &mut RunAccumulator,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let clock = Instant::now();
        let source = ctx.source.clone();
        let base_url = source.base_url.as_str();

        let granularity = self.transport.granularity(base_url).await?;
        let prefixes = self.resolve_prefixes(&source).await?;

        let profile = self
            .profiles
            .get(&source.collection)
            .cloned()
            .unwrap_or_default();
        let validator = Validator::new(
            self.registry.crosswalk(&source.metadata_format),
            profile.required_fields,
            source.effective_set().map(str::to_string),
        );

        let mut request = ListRecordsRequest::new(prefixes.metadata.as_str())
            .with_until(granularity.format(ctx.harvested_at));
        if let Some(last) = source.last_harvest_at {
            let padding = chrono::Duration::from_std(self.config.time_padding)
                .map_err(|e| HarvestError::Config(format!("time padding: {e}")))?;
            request = request.with_from(granularity.format(last - padding));
        }
        if let Some(set) = source.effective_set() {
            request = request.with_set(set);
        }
        tracing::info!(
            run_id = %run.id,
            prefix = %request.metadata_prefix,
            from = ?request.from,
            until = ?request.until,
            set = ?request.set,
            ?granularity,
            "requesting records"
        );

        let mut envelope = self.transport.list_records(base_url, &request).await?;
        let mut page: u32 = 1;

        loop {
            if envelope.is_no_records_match()
                && envelope.errors.iter().all(|e| e.kind.is_empty_result())
            {
                tracing::info!(run_id = %run.id, page, "no records match");
                break;
            }
            let checked = envelope.into_checked()?;
            let records = checked.records()?;
            tracing::debug!(run_id = %run.id, page, records = records.len(), "processing page");

            for record in records {
                if cancel.is_cancelled() {
                    tracing::warn!(run_id = %run.id, "harvest run aborted");
                    return Ok(RunOutcome::Aborted);
                }
                if clock.elapsed() > self.config.timeout {
                    return Err(HarvestError::RunExpired {
                        limit_secs: self.config.timeout.as_secs(),
                    });
                }
                self.process_record(ctx, &validator, &prefixes, acc, record)
                    .await?;
            }

            let next = checked.next_token().map(str::to_string);
            self.store
                .record_run_progress(run.id, next.as_deref(), &acc.counts)
                .await?;

            let Some(token) = next else {
                break;
            };
            if cancel.is_cancelled() {
                tracing::warn!(run_id = %run.id, "harvest run aborted");
                return Ok(RunOutcome::Aborted);
            }
            envelope = self.transport.list_records_resume(base_url, &token).await?;
            page += 1;
        }

        Ok(acc.outcome())
    }

    async fn resolve_prefixes(&self, source: &HarvestSource) -> Result<Prefixes> {
        let base_url = source.base_url.as_str();

        let metadata = match self.registry.get(&source.metadata_format) {
            Some(format) => self
                .transport
                .resolve_namespace_to_prefix(base_url, &format.namespace)
                .await?
                .ok_or_else(|| HarvestError::FormatNotSupported {
                    format: source.metadata_format.clone(),
                    base_url: base_url.to_string(),
                })?,
            None => source.metadata_format.clone(),
        };

        let ore = if source.harvest_mode.needs_ore() {
            let prefix = self
                .transport
                .resolve_namespace_to_prefix(base_url, ORE_ATOM_NAMESPACE)
                .await?
                .ok_or_else(|| HarvestError::FormatNotSupported {
                    format: "ORE".to_string(),
                    base_url: base_url.to_string(),
                })?;
            Some(prefix)
        } else {
            None
        };

        Ok(Prefixes { metadata, ore })
    }

    /// Validate and reconcile one record. Record-level failures are counted;
    /// anything returned as `Err` fails the run.
    async fn process_record(
        &self,
        ctx: &mut RunContext,
        validator: &Validator,
        prefixes: &Prefixes,
        acc: &mut RunAccumulator,
        record: OaiRecord,
    ) -> Result<()> {
        acc.counts.processed += 1;
        let identifier = record.header.identifier.clone();

        let incoming = if record.header.deleted {
            IncomingRecord {
                oai_identifier: identifier.clone(),
                remote_datestamp: record.header.datestamp,
                is_deleted: true,
                content: None,
            }
        } else {
            let validated = match validator.validate(&record) {
                ValidationResult::Accepted(validated) => validated,
                ValidationResult::Rejected { reason, .. } => {
                    tracing::warn!(oai_identifier = %identifier, %reason, "record rejected");
                    acc.reject(&identifier, reason);
                    return Ok(());
                }
            };

            let (ore_document, content_links) = match &prefixes.ore {
                Some(ore_prefix) => {
                    match self
                        .fetch_ore(&ctx.source, &identifier, ore_prefix)
                        .await
                    {
                        Ok(ore) => ore,
                        Err(e) if e.is_record_level() => {
                            tracing::warn!(oai_identifier = %identifier, error = %e, "record failed");
                            acc.fail(&identifier, &e);
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => (None, Vec::new()),
            };

            IncomingRecord {
                oai_identifier: identifier.clone(),
                remote_datestamp: record.header.datestamp,
                is_deleted: false,
                content: Some(RecordContent {
                    validated,
                    ore_document,
                    content_links,
                }),
            }
        };

        match reconcile(self.store.as_ref(), ctx, incoming).await {
            Ok(outcome) => {
                acc.record(outcome);
                Ok(())
            }
            Err(e) if e.is_record_level() => {
                tracing::warn!(oai_identifier = %identifier, error = %e, "record failed");
                acc.fail(&identifier, &e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The ORE resource map of a record and, in full mode, its aggregated
    /// resource links.
    async fn fetch_ore(
        &self,
        source: &HarvestSource,
        identifier: &str,
        ore_prefix: &str,
    ) -> Result<(Option<String>, Vec<String>)> {
        let envelope = self
            .transport
            .get_record(&source.base_url, identifier, ore_prefix)
            .await?;
        let envelope = envelope.into_checked().map_err(|e| HarvestError::Ore {
            oai_identifier: identifier.to_string(),
            source: e,
        })?;
        let document = envelope
            .records()
            .map_err(|e| HarvestError::Ore {
                oai_identifier: identifier.to_string(),
                source: e,
            })?
            .into_iter()
            .next()
            .and_then(|r| r.metadata);

        let links = match (&document, source.harvest_mode) {
            (Some(doc), HarvestMode::Full) => ore_aggregated_links(doc)?,
            _ => Vec::new(),
        };
        Ok((document, links))
    }
}
