//! Run reports and the notification channel.
//!
//! The sink only formats and forwards; nothing here feeds back into the run.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{HarvestSource, RunCounts, RunOutcome};

/// One record that did not make it into the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub oai_identifier: String,
    /// `rejected` or `failed`.
    pub kind: String,
    pub reason: String,
}

/// Statistics and failures of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub failures: Vec<RecordFailure>,
    /// The error that ended a FAILED or ABORTED run.
    pub error: Option<String>,
}

/// A rendered report, ready to attach to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub name: String,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);

        writeln!(f, "Harvest report for source {}", self.source_id)?;
        writeln!(f, "Repository: {}", self.base_url)?;
        writeln!(f, "Run:        {}", self.run_id)?;
        writeln!(f, "Started:    {}", stamp(&self.started_at))?;
        writeln!(f, "Finished:   {}", stamp(&self.finished_at))?;
        writeln!(f, "Outcome:    {}", self.outcome)?;
        writeln!(f)?;

        let c = &self.counts;
        writeln!(f, "Processed:  {}", c.processed)?;
        writeln!(f, "Created:    {}", c.created)?;
        writeln!(f, "Updated:    {}", c.updated)?;
        writeln!(f, "Tombstoned: {}", c.tombstoned)?;
        writeln!(f, "Unchanged:  {}", c.skipped)?;
        writeln!(f, "Rejected:   {}", c.rejected)?;
        writeln!(f, "Failed:     {}", c.failed)?;

        if let Some(error) = &self.error {
            writeln!(f)?;
            writeln!(f, "Error: {error}")?;
        }

        if !self.failures.is_empty() {
            writeln!(f)?;
            writeln!(f, "Record failures:")?;
            for failure in &self.failures {
                writeln!(
                    f,
                    "  [{}] {}: {}",
                    failure.kind, failure.oai_identifier, failure.reason
                )?;
            }
        }
        Ok(())
    }
}

/// Render a human-readable plain text report.
#[must_use]
pub fn generate(report: &RunReport) -> ReportArtifact {
    ReportArtifact {
        bytes: report.to_string().into_bytes(),
        mime_type: "text/plain".to_string(),
        name: format!(
            "harvest-{}-{}.txt",
            report.source_id,
            report.started_at.format("%Y%m%dT%H%M%SZ")
        ),
    }
}

/// Delivery channel for run notifications (e-mail, chat, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_completion_with_errors(
        &self,
        recipient: &str,
        source: &HarvestSource,
        report: &ReportArtifact,
    );

    async fn notify_failure(
        &self,
        recipient: &str,
        source: &HarvestSource,
        error: &str,
        report: &ReportArtifact,
    );
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_completion_with_errors(
        &self,
        recipient: &str,
        source: &HarvestSource,
        report: &ReportArtifact,
    ) {
        tracing::warn!(
            recipient,
            source_id = %source.source_id,
            report = %report.name,
            "harvest completed with errors"
        );
    }

    async fn notify_failure(
        &self,
        recipient: &str,
        source: &HarvestSource,
        error: &str,
        report: &ReportArtifact,
    ) {
        tracing::error!(
            recipient,
            source_id = %source.source_id,
            error,
            report = %report.name,
            "harvest failed"
        );
    }
}

/// A sent notification, as captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipient: String,
    pub source_id: String,
    pub outcome: RunOutcome,
    pub report: ReportArtifact,
}

/// Keeps notifications in memory; for embedders and tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn push(&self, notification: SentNotification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_completion_with_errors(
        &self,
        recipient: &str,
        source: &HarvestSource,
        report: &ReportArtifact,
    ) {
        self.push(SentNotification {
            recipient: recipient.to_string(),
            source_id: source.source_id.clone(),
            outcome: RunOutcome::CompleteWithErrors,
            report: report.clone(),
        });
    }

    async fn notify_failure(
        &self,
        recipient: &str,
        source: &HarvestSource,
        _error: &str,
        report: &ReportArtifact,
    ) {
        self.push(SentNotification {
            recipient: recipient.to_string(),
            source_id: source.source_id.clone(),
            outcome: RunOutcome::Failed,
            report: report.clone(),
        });
    }
}

/// Routes finished runs to the notifier.
///
/// COMPLETE_WITH_ERRORS and FAILED runs are reported when a recipient is
/// configured; COMPLETE and ABORTED runs are only logged.
pub struct ReportSink {
    notifier: Arc<dyn Notifier>,
    recipient: Option<String>,
}

impl ReportSink {
    pub fn new(notifier: Arc<dyn Notifier>, recipient: Option<String>) -> Self {
        Self {
            notifier,
            recipient,
        }
    }

    /// Sink that only logs.
    pub fn logging(recipient: Option<String>) -> Self {
        Self::new(Arc::new(LogNotifier), recipient)
    }

    pub async fn observe(&self, source: &HarvestSource, report: &RunReport) {
        tracing::info!(
            source_id = %report.source_id,
            run_id = %report.run_id,
            outcome = %report.outcome,
            processed = report.counts.processed,
            created = report.counts.created,
            updated = report.counts.updated,
            tombstoned = report.counts.tombstoned,
            rejected = report.counts.rejected,
            failed = report.counts.failed,
            "harvest run finished"
        );

        let Some(recipient) = self.recipient.as_deref() else {
            return;
        };
        match report.outcome {
            RunOutcome::CompleteWithErrors => {
                let artifact = generate(report);
                self.notifier
                    .notify_completion_with_errors(recipient, source, &artifact)
                    .await;
            }
            RunOutcome::Failed => {
                let artifact = generate(report);
                let error = report.error.as_deref().unwrap_or("unknown error");
                self.notifier
                    .notify_failure(recipient, source, error, &artifact)
                    .await;
            }
            RunOutcome::Complete | RunOutcome::Aborted => {}
        }
    }
}
