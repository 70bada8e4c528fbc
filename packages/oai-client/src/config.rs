//! Configuration constants, client settings and validation functions.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use url::Url;

use crate::error::{OaiError, Result};
use crate::types::Verb;

/// XML namespace of OAI-PMH 2.0 responses.
pub const OAI_PMH_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/";

/// HTTP timeout in seconds.
///
/// Large ListRecords pages from slow repositories can take a while to render.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
pub const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Upper bound for a server-requested `Retry-After` delay (seconds).
pub const MAX_RETRY_AFTER_SECS: u64 = 300;

/// User agent string identifying this client.
pub const USER_AGENT: &str = concat!("oai-client/", env!("CARGO_PKG_VERSION"));

/// Day-granularity datestamp: YYYY-MM-DD.
#[allow(clippy::expect_used)] // Static regex that is guaranteed to be valid
static DAY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"));

/// Second-granularity datestamp: YYYY-MM-DDThh:mm:ssZ.
#[allow(clippy::expect_used)] // Static regex that is guaranteed to be valid
static SECOND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z$").expect("valid regex")
});

/// Settings for the HTTP transport underneath the protocol client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_retry_after: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(HTTP_TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_retry_after: Duration::from_secs(MAX_RETRY_AFTER_SECS),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let timeout_secs: u64 = std::env::var("OAI_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(HTTP_TIMEOUT_SECS);

        let max_retries = std::env::var("OAI_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MAX_RETRIES);

        let retry_base_delay_ms: u64 = std::env::var("OAI_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(RETRY_BASE_DELAY_MS);

        let user_agent = std::env::var("OAI_USER_AGENT").unwrap_or(defaults.user_agent);

        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_retries: max_retries.max(1),
            retry_base_delay: Duration::from_millis(retry_base_delay_ms),
            max_retry_after: defaults.max_retry_after,
            user_agent,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_max_retry_after(mut self, delay: Duration) -> Self {
        self.max_retry_after = delay;
        self
    }
}

/// Validate an OAI-PMH base URL.
///
/// The base URL must be absolute http(s) and carry no query string; verb
/// arguments are appended to it.
///
/// # Examples
/// ```
/// use oai_client::config::validate_base_url;
///
/// assert!(validate_base_url("https://repository.example.org/oai/request").is_ok());
/// assert!(validate_base_url("ftp://example.org/oai").is_err());
/// assert!(validate_base_url("https://example.org/oai?verb=Identify").is_err());
/// ```
pub fn validate_base_url(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url).map_err(|_| OaiError::InvalidBaseUrl(base_url.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.query().is_some() {
        return Err(OaiError::InvalidBaseUrl(base_url.to_string()));
    }
    Ok(url)
}

/// Build a request URL for a verb and its arguments.
///
/// Argument values are percent-encoded; resumption tokens are passed through
/// unchanged otherwise.
pub fn verb_url(base_url: &str, verb: Verb, args: &[(&str, &str)]) -> Result<String> {
    let mut url = validate_base_url(base_url)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("verb", verb.as_ref());
        for (name, value) in args {
            pairs.append_pair(name, value);
        }
    }
    Ok(url.into())
}

/// Parse an OAI-PMH datestamp at either granularity.
///
/// Day-granularity values resolve to midnight UTC.
///
/// # Examples
/// ```
/// use oai_client::config::parse_datestamp;
///
/// assert!(parse_datestamp("2024-01-01").is_ok());
/// assert!(parse_datestamp("2024-01-01T10:00:00Z").is_ok());
/// assert!(parse_datestamp("01/01/2024").is_err());
/// ```
pub fn parse_datestamp(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if DAY_PATTERN.is_match(text) {
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_err(|_| OaiError::InvalidDatestamp(text.to_string()))?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| OaiError::InvalidDatestamp(text.to_string()))?;
        return Ok(midnight.and_utc());
    }
    if SECOND_PATTERN.is_match(text) {
        return DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| OaiError::InvalidDatestamp(text.to_string()));
    }
    Err(OaiError::InvalidDatestamp(text.to_string()))
}
