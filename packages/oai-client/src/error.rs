//! Error types for the OAI-PMH client.
//!
//! Transport failures and protocol failures are kept apart: a repository can
//! answer HTTP 200 with an `<error code="...">` body, and callers pick their
//! retry policy from the [`ProtocolErrorKind`], not from the HTTP layer.

use thiserror::Error;

use crate::types::ProtocolErrorKind;

/// Main error type for the OAI-PMH client.
#[derive(Debug, Error)]
pub enum OaiError {
    /// Base URL is not an absolute http(s) URL without a query string.
    #[error("Invalid OAI-PMH base URL: '{0}'")]
    InvalidBaseUrl(String),

    /// Datestamp does not match either OAI-PMH granularity.
    #[error("Invalid datestamp: '{0}'. Expected YYYY-MM-DD or YYYY-MM-DDThh:mm:ssZ")]
    InvalidDatestamp(String),

    /// HTTP request failed without a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status that is not retried.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// All retry attempts were used up on transient failures.
    #[error("Request failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// The repository answered with an OAI-PMH `<error>` element.
    #[error("OAI-PMH error {kind}: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// XML parsing failed.
    #[error("XML parsing failed: {0}")]
    XmlParse(#[from] roxmltree::Error),

    /// Missing required XML element.
    #[error("Missing required XML element: {element} in {context}")]
    MissingElement { element: String, context: String },
}

impl OaiError {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Connection errors, timeouts and 5xx answers are transient; protocol
    /// errors and malformed responses are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_body(),
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::RetriesExhausted { .. } => true,
            _ => false,
        }
    }

    /// The protocol error kind, if this is an OAI-PMH `<error>`.
    #[must_use]
    pub fn protocol_kind(&self) -> Option<&ProtocolErrorKind> {
        match self {
            Self::Protocol { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, OaiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OaiError::InvalidBaseUrl("ftp://example.org".to_string());
        assert!(err.to_string().contains("ftp://example.org"));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = OaiError::Protocol {
            kind: ProtocolErrorKind::BadResumptionToken,
            message: "expired".to_string(),
        };
        assert_eq!(err.to_string(), "OAI-PMH error badResumptionToken: expired");
        assert!(!err.is_transient());
        assert_eq!(
            err.protocol_kind(),
            Some(&ProtocolErrorKind::BadResumptionToken)
        );
    }

    #[test]
    fn test_status_transience() {
        let server_error = OaiError::HttpStatus {
            status: 502,
            url: "http://example.org/oai".to_string(),
        };
        let not_found = OaiError::HttpStatus {
            status: 404,
            url: "http://example.org/oai".to_string(),
        };
        assert!(server_error.is_transient());
        assert!(!not_found.is_transient());
    }
}
