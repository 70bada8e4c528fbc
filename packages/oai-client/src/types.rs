//! Core data types for the OAI-PMH client.
//!
//! These types mirror the OAI-PMH 2.0 response vocabulary: verbs, error
//! codes, record headers, resumption tokens and the identify/format/set
//! descriptions a repository publishes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// OAI-PMH request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
pub enum Verb {
    Identify,
    ListMetadataFormats,
    ListSets,
    ListIdentifiers,
    ListRecords,
    GetRecord,
}

impl Verb {
    /// Whether responses to this verb may carry a `<resumptionToken>`.
    #[must_use]
    pub fn is_paged(&self) -> bool {
        matches!(
            self,
            Self::ListSets | Self::ListIdentifiers | Self::ListRecords
        )
    }
}

/// Error codes defined by OAI-PMH 2.0, section 3.6.
///
/// Each code is a distinct kind; `Other` keeps non-standard codes some
/// repositories emit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString)]
pub enum ProtocolErrorKind {
    #[strum(serialize = "badArgument")]
    BadArgument,
    #[strum(serialize = "badResumptionToken")]
    BadResumptionToken,
    #[strum(serialize = "badVerb")]
    BadVerb,
    #[strum(serialize = "cannotDisseminateFormat")]
    CannotDisseminateFormat,
    #[strum(serialize = "idDoesNotExist")]
    IdDoesNotExist,
    #[strum(serialize = "noMetadataFormats")]
    NoMetadataFormats,
    #[strum(serialize = "noRecordsMatch")]
    NoRecordsMatch,
    #[strum(serialize = "noSetHierarchy")]
    NoSetHierarchy,
    #[strum(default)]
    Other(String),
}

impl ProtocolErrorKind {
    /// The wire code, as it appears in `<error code="...">`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::BadArgument => "badArgument",
            Self::BadResumptionToken => "badResumptionToken",
            Self::BadVerb => "badVerb",
            Self::CannotDisseminateFormat => "cannotDisseminateFormat",
            Self::IdDoesNotExist => "idDoesNotExist",
            Self::NoMetadataFormats => "noMetadataFormats",
            Self::NoRecordsMatch => "noRecordsMatch",
            Self::NoSetHierarchy => "noSetHierarchy",
            Self::Other(code) => code,
        }
    }

    /// Parse a wire code. Unknown codes become [`ProtocolErrorKind::Other`].
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        code.parse()
            .unwrap_or_else(|_| Self::Other(code.to_string()))
    }

    /// `noRecordsMatch` is an empty result, not a failure.
    #[must_use]
    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::NoRecordsMatch)
    }
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `<error>` element from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

/// Datestamp granularity declared by a repository in `Identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Granularity {
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM-DDThh:mm:ssZ`
    #[default]
    Second,
}

impl Granularity {
    /// Parse the `<granularity>` text of an Identify response.
    ///
    /// Anything other than the day pattern is treated as second granularity,
    /// the only other value OAI-PMH 2.0 allows.
    #[must_use]
    pub fn from_identify(text: &str) -> Self {
        if text.trim() == "YYYY-MM-DD" {
            Self::Day
        } else {
            Self::Second
        }
    }

    /// Format a timestamp at this granularity, truncating finer precision.
    #[must_use]
    pub fn format(&self, instant: DateTime<Utc>) -> String {
        match self {
            Self::Day => instant.format("%Y-%m-%d").to_string(),
            Self::Second => instant.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// A `<resumptionToken>` element.
///
/// The token value is opaque; it is forwarded to the repository exactly as
/// received. An empty value marks the last page of a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumptionToken {
    pub value: String,
    pub complete_list_size: Option<u64>,
    pub cursor: Option<u64>,
    pub expiration_date: Option<String>,
}

impl ResumptionToken {
    /// The token to send for the next page, if there is one.
    #[must_use]
    pub fn next(&self) -> Option<&str> {
        let value = self.value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// The `<header>` of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub identifier: String,
    pub datestamp: String,
    pub set_specs: Vec<String>,
    /// `status="deleted"` on the header.
    pub deleted: bool,
}

/// A harvested record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OaiRecord {
    pub header: RecordHeader,
    /// The metadata payload as a standalone XML string (namespace
    /// declarations inherited from the envelope are copied onto its root),
    /// or the raw text content when the repository sent escaped markup.
    /// `None` for deleted records and records without `<metadata>`.
    pub metadata: Option<String>,
}

/// Repository description from `Identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIdentity {
    pub repository_name: String,
    pub base_url: String,
    pub protocol_version: String,
    pub earliest_datestamp: Option<String>,
    pub deleted_record: DeletedRecordPolicy,
    pub granularity: Granularity,
    pub admin_emails: Vec<String>,
}

/// How a repository reports deletions (`<deletedRecord>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedRecordPolicy {
    #[default]
    No,
    Transient,
    Persistent,
}

impl DeletedRecordPolicy {
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        match text.trim() {
            "persistent" => Self::Persistent,
            "transient" => Self::Transient,
            _ => Self::No,
        }
    }
}

/// One `<metadataFormat>` from `ListMetadataFormats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFormat {
    pub metadata_prefix: String,
    pub schema: Option<String>,
    pub metadata_namespace: String,
}

/// One `<set>` from `ListSets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OaiSet {
    pub set_spec: String,
    pub set_name: String,
}

/// Selective-harvest parameters for the first `ListRecords` request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListRecordsRequest {
    pub metadata_prefix: String,
    pub from: Option<String>,
    pub until: Option<String>,
    pub set: Option<String>,
}

impl ListRecordsRequest {
    pub fn new(metadata_prefix: impl Into<String>) -> Self {
        Self {
            metadata_prefix: metadata_prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_until(mut self, until: impl Into<String>) -> Self {
        self.until = Some(until.into());
        self
    }

    pub fn with_set(mut self, set: impl Into<String>) -> Self {
        self.set = Some(set.into());
        self
    }
}
