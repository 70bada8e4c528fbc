use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Display, AsRefStr,
)]
#[sqlx(type_name = "source_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum SourceStatus {
    Ready,
    /// Operator asked for a run on the next scheduler cycle.
    Queue,
    /// Held by a running harvest.
    Busy,
    /// The process running the last harvest died.
    Orphaned,
    Disabled,
}

impl SourceStatus {
    /// Statuses from which a source may be claimed for a run.
    #[must_use]
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Ready | Self::Queue | Self::Orphaned)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    Display,
    AsRefStr,
    EnumString,
)]
#[sqlx(type_name = "harvest_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HarvestMode {
    #[default]
    MetadataOnly,
    /// Metadata plus the ORE resource map of each record.
    MetadataAndRefs,
    /// Metadata, resource map and the aggregated content links.
    Full,
}

impl HarvestMode {
    #[must_use]
    pub fn needs_ore(self) -> bool {
        !matches!(self, Self::MetadataOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Display, AsRefStr)]
#[sqlx(type_name = "run_outcome", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Complete,
    CompleteWithErrors,
    Failed,
    Aborted,
}

impl RunOutcome {
    /// Whether the source's last-harvest timestamp moves to the run's start.
    #[must_use]
    pub fn advances_harvest_date(self) -> bool {
        matches!(self, Self::Complete | Self::CompleteWithErrors)
    }
}

/// Definition of a source as it comes from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub source_id: String,
    pub base_url: String,
    #[serde(default, rename = "set")]
    pub set_spec: Option<String>,
    pub collection: String,
    /// Key into the metadata format registry, or a literal prefix.
    pub metadata_format: String,
    #[serde(default)]
    pub harvest_mode: HarvestMode,
}

impl SourceDefinition {
    pub fn new(
        source_id: impl Into<String>,
        base_url: impl Into<String>,
        collection: impl Into<String>,
        metadata_format: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            set_spec: None,
            collection: collection.into(),
            metadata_format: metadata_format.into(),
            harvest_mode: HarvestMode::default(),
        }
    }

    pub fn with_set(mut self, set_spec: impl Into<String>) -> Self {
        self.set_spec = Some(set_spec.into());
        self
    }

    pub fn with_mode(mut self, mode: HarvestMode) -> Self {
        self.harvest_mode = mode;
        self
    }

    /// See [`HarvestSource::effective_set`].
    #[must_use]
    pub fn effective_set(&self) -> Option<&str> {
        effective_set(self.set_spec.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HarvestSource {
    pub source_id: String,
    pub base_url: String,
    pub set_spec: Option<String>,
    pub collection: String,
    pub metadata_format: String,
    pub harvest_mode: HarvestMode,
    pub status: SourceStatus,
    /// Start time of the last run that completed; `None` means harvest everything.
    pub last_harvest_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    /// When harvest dates were last cleared. A run started before this never advances `last_harvest_at`.
    pub reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HarvestSource {
    /// The set to restrict harvesting to. `all` and blank mean no restriction.
    #[must_use]
    pub fn effective_set(&self) -> Option<&str> {
        effective_set(self.set_spec.as_deref())
    }

    /// Whether a run started at `started_at` may record its start as the new harvest date.
    #[must_use]
    pub fn accepts_harvest_date(&self, started_at: DateTime<Utc>) -> bool {
        self.reset_at.is_none_or(|reset_at| reset_at <= started_at)
    }

    /// The configuration this source was created from.
    #[must_use]
    pub fn definition(&self) -> SourceDefinition {
        SourceDefinition {
            source_id: self.source_id.clone(),
            base_url: self.base_url.clone(),
            set_spec: self.set_spec.clone(),
            collection: self.collection.clone(),
            metadata_format: self.metadata_format.clone(),
            harvest_mode: self.harvest_mode,
        }
    }
}

fn effective_set(set_spec: Option<&str>) -> Option<&str> {
    set_spec
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "all")
}

/// Per-run record counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub tombstoned: i64,
    pub skipped: i64,
    pub rejected: i64,
    pub failed: i64,
}

impl RunCounts {
    /// Records that did not make it into the local store.
    #[must_use]
    pub fn errors(&self) -> i64 {
        self.rejected + self.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HarvestRun {
    pub id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Resumption token of the next page; only set while the run is open.
    pub cursor: Option<String>,
    pub records_processed: i64,
    pub records_created: i64,
    pub records_updated: i64,
    pub records_tombstoned: i64,
    pub records_skipped: i64,
    pub records_rejected: i64,
    pub records_failed: i64,
    /// `None` while running.
    pub outcome: Option<RunOutcome>,
    pub message: Option<String>,
}

impl HarvestRun {
    #[must_use]
    pub fn counts(&self) -> RunCounts {
        RunCounts {
            processed: self.records_processed,
            created: self.records_created,
            updated: self.records_updated,
            tombstoned: self.records_tombstoned,
            skipped: self.records_skipped,
            rejected: self.records_rejected,
            failed: self.records_failed,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HarvestedRecordLink {
    pub id: Uuid,
    pub source_id: String,
    pub oai_identifier: String,
    pub object_id: Uuid,
    pub remote_datestamp: String,
    /// SHA-256 of the metadata payload last applied.
    pub content_hash: Option<String>,
    pub tombstoned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One descriptive metadata value, `schema.element[.qualifier]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub schema: String,
    pub element: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub value: String,
}

impl MetadataValue {
    pub fn new(schema: &str, element: &str, qualifier: Option<&str>, value: impl Into<String>) -> Self {
        Self {
            schema: schema.to_string(),
            element: element.to_string(),
            qualifier: qualifier.map(str::to_string),
            language: None,
            value: value.into(),
        }
    }

    /// `dc.title`, `dc.identifier.uri`
    #[must_use]
    pub fn field_name(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}.{}", self.schema, self.element, q),
            None => format!("{}.{}", self.schema, self.element),
        }
    }

    /// Whether this value is `field` itself or one of its qualified forms.
    #[must_use]
    pub fn matches_field(&self, field: &str) -> bool {
        let name = self.field_name();
        name == field
            || name
                .strip_prefix(field)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// The mirrored copy of a remote record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalObject {
    pub id: Uuid,
    pub collection: String,
    /// `{source_id}::{oai_identifier}`
    pub external_id: String,
    pub handle: Option<String>,
    pub metadata: Json<Vec<MetadataValue>>,
    pub ore_document: Option<String>,
    pub content_links: Json<Vec<String>>,
    pub withdrawn: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalObject {
    /// Values of the given field, in stored order.
    pub fn values<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.metadata
            .0
            .iter()
            .filter(move |v| v.field_name() == field)
            .map(|v| v.value.as_str())
    }
}

#[must_use]
pub fn external_id(source_id: &str, oai_identifier: &str) -> String {
    format!("{source_id}::{oai_identifier}")
}

/// Everything needed to create a local object and its link atomically.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub source_id: String,
    pub oai_identifier: String,
    pub collection: String,
    pub handle: Option<String>,
    pub metadata: Vec<MetadataValue>,
    pub ore_document: Option<String>,
    pub content_links: Vec<String>,
    pub remote_datestamp: String,
    pub content_hash: String,
}

/// Replacement content for an existing object.
#[derive(Debug, Clone)]
pub struct ObjectUpdate {
    pub metadata: Vec<MetadataValue>,
    pub ore_document: Option<String>,
    pub content_links: Vec<String>,
    pub remote_datestamp: String,
    pub content_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_set() {
        let mut source = HarvestSource {
            source_id: "s".into(),
            base_url: "http://x/oai".into(),
            set_spec: Some("all".into()),
            collection: "c".into(),
            metadata_format: "dc".into(),
            harvest_mode: HarvestMode::MetadataOnly,
            status: SourceStatus::Ready,
            last_harvest_at: None,
            last_outcome: None,
            last_attempt_at: None,
            last_message: None,
            reset_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(source.effective_set(), None);
        source.set_spec = Some(" col_7 ".into());
        assert_eq!(source.effective_set(), Some("col_7"));
        source.set_spec = None;
        assert_eq!(source.effective_set(), None);
    }

    #[test]
    fn test_field_matching() {
        let uri = MetadataValue::new("dc", "identifier", Some("uri"), "http://hdl.handle.net/1/2");
        assert_eq!(uri.field_name(), "dc.identifier.uri");
        assert!(uri.matches_field("dc.identifier"));
        assert!(uri.matches_field("dc.identifier.uri"));
        assert!(!uri.matches_field("dc.ident"));
        assert!(!uri.matches_field("dc.title"));
    }

    #[test]
    fn test_outcome_advances_harvest_date() {
        assert!(RunOutcome::Complete.advances_harvest_date());
        assert!(RunOutcome::CompleteWithErrors.advances_harvest_date());
        assert!(!RunOutcome::Failed.advances_harvest_date());
        assert!(!RunOutcome::Aborted.advances_harvest_date());
        assert_eq!(RunOutcome::CompleteWithErrors.to_string(), "COMPLETE_WITH_ERRORS");
    }

    #[test]
    fn test_claimable_statuses() {
        assert!(SourceStatus::Ready.is_claimable());
        assert!(SourceStatus::Queue.is_claimable());
        assert!(SourceStatus::Orphaned.is_claimable());
        assert!(!SourceStatus::Busy.is_claimable());
        assert!(!SourceStatus::Disabled.is_claimable());
    }

    #[test]
    fn test_source_definition_yaml() {
        let yaml = r#"
source_id: theses
base_url: https://repo.example.org/oai/request
set: col_123456789_2
collection: theses
metadata_format: dc
harvest_mode: metadata_and_refs
"#;
        let def: SourceDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.set_spec.as_deref(), Some("col_123456789_2"));
        assert_eq!(def.harvest_mode, HarvestMode::MetadataAndRefs);
    }
}
