//! Acceptance rules for harvested records.
//!
//! Checks run in a fixed order and stop at the first failure:
//! well-formedness, required fields, set membership. A rejection is a
//! record-level outcome; it never stops the run.

use std::fmt;

use oai_client::OaiRecord;

use crate::crosswalk::Crosswalk;
use crate::models::MetadataValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A live record without a `<metadata>` payload.
    MissingMetadata,
    MalformedXml(String),
    Crosswalk(String),
    MissingField(String),
    SetMismatch {
        expected: String,
        declared: Vec<String>,
    },
}

impl Violation {
    /// Short rule name used in reports.
    #[must_use]
    pub fn rule(&self) -> &'static str {
        match self {
            Self::MissingMetadata | Self::MalformedXml(_) => "well-formed",
            Self::Crosswalk(_) => "crosswalk",
            Self::MissingField(_) => "required-field",
            Self::SetMismatch { .. } => "set-membership",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMetadata => write!(f, "record has no metadata payload"),
            Self::MalformedXml(e) => write!(f, "metadata is not well-formed XML: {e}"),
            Self::Crosswalk(e) => write!(f, "metadata could not be mapped: {e}"),
            Self::MissingField(field) => write!(f, "required field {field} is missing"),
            Self::SetMismatch { expected, declared } => write!(
                f,
                "record is not in set {expected} (declared: {})",
                if declared.is_empty() {
                    "none".to_string()
                } else {
                    declared.join(", ")
                }
            ),
        }
    }
}

/// An accepted record with its mapped metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRecord {
    pub payload: String,
    pub metadata: Vec<MetadataValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Accepted(ValidatedRecord),
    Rejected {
        violations: Vec<Violation>,
        reason: String,
    },
}

impl ValidationResult {
    fn reject(violation: Violation) -> Self {
        Self::Rejected {
            reason: violation.to_string(),
            violations: vec![violation],
        }
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// The rules of one run: target collection profile and harvest set.
#[derive(Debug, Clone)]
pub struct Validator {
    crosswalk: Crosswalk,
    required_fields: Vec<String>,
    harvest_set: Option<String>,
}

impl Validator {
    pub fn new(crosswalk: Crosswalk, required_fields: Vec<String>, harvest_set: Option<String>) -> Self {
        Self {
            crosswalk,
            required_fields,
            harvest_set,
        }
    }

    pub fn validate(&self, record: &OaiRecord) -> ValidationResult {
        let Some(payload) = record.metadata.as_deref() else {
            return ValidationResult::reject(Violation::MissingMetadata);
        };

        if let Err(e) = roxmltree::Document::parse(payload) {
            return ValidationResult::reject(Violation::MalformedXml(e.to_string()));
        }

        let metadata = match self.crosswalk.apply(payload) {
            Ok(values) => values,
            Err(e) => return ValidationResult::reject(Violation::Crosswalk(e.to_string())),
        };

        let missing: Vec<Violation> = self
            .required_fields
            .iter()
            .filter(|field| !metadata.iter().any(|v| v.matches_field(field)))
            .map(|field| Violation::MissingField(field.clone()))
            .collect();
        if !missing.is_empty() {
            let reason = missing
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return ValidationResult::Rejected {
                violations: missing,
                reason,
            };
        }

        if let Some(expected) = &self.harvest_set {
            if !record.header.set_specs.iter().any(|s| s == expected) {
                return ValidationResult::reject(Violation::SetMismatch {
                    expected: expected.clone(),
                    declared: record.header.set_specs.clone(),
                });
            }
        }

        ValidationResult::Accepted(ValidatedRecord {
            payload: payload.to_string(),
            metadata,
        })
    }
}
