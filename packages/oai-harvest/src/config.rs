use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::models::SourceDefinition;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| HarvestError::Config("DATABASE_URL not set".into()))?;

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            database_url,
            max_connections,
        })
    }

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// When and how many harvests the scheduler starts.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due sources are evaluated.
    pub poll_interval: Duration,
    /// Maximum number of runs in flight across all sources.
    pub concurrency: usize,
    /// Minimum time between two successful harvests of one source.
    pub harvest_interval: Duration,
    /// Minimum time before a failed source is attempted again.
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            concurrency: 3,
            harvest_interval: Duration::from_secs(12 * 60 * 60),
            retry_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_secs("HARVEST_POLL_INTERVAL_SECS").unwrap_or(defaults.poll_interval),
            concurrency: std::env::var("HARVEST_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.concurrency)
                .max(1),
            harvest_interval: env_secs("HARVEST_INTERVAL_SECS")
                .unwrap_or(defaults.harvest_interval),
            retry_delay: env_secs("HARVEST_RETRY_DELAY_SECS").unwrap_or(defaults.retry_delay),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_harvest_interval(mut self, interval: Duration) -> Self {
        self.harvest_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Handles accepted from `dc.identifier` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlePolicy {
    pub accepted_servers: Vec<String>,
    pub rejected_prefixes: Vec<String>,
}

impl Default for HandlePolicy {
    fn default() -> Self {
        Self {
            accepted_servers: vec!["hdl.handle.net".to_string()],
            rejected_prefixes: vec!["123456789".to_string()],
        }
    }
}

/// Settings that apply to every harvest run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Subtracted from the previous start time when building `from`.
    pub time_padding: Duration,
    /// A run still going after this long fails.
    pub timeout: Duration,
    /// Where run reports go on errors and failures.
    pub alert_recipient: Option<String>,
    pub handle_policy: HandlePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            time_padding: Duration::from_secs(120),
            timeout: Duration::from_secs(24 * 60 * 60),
            alert_recipient: None,
            handle_policy: HandlePolicy::default(),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let list = |name: &str, fallback: Vec<String>| -> Vec<String> {
            std::env::var(name)
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(fallback)
        };

        Self {
            time_padding: env_secs("HARVEST_TIME_PADDING_SECS").unwrap_or(defaults.time_padding),
            timeout: env_secs("HARVEST_RUN_TIMEOUT_SECS").unwrap_or(defaults.timeout),
            alert_recipient: std::env::var("HARVEST_ALERT_RECIPIENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            handle_policy: HandlePolicy {
                accepted_servers: list(
                    "HARVEST_ACCEPTED_HANDLE_SERVERS",
                    defaults.handle_policy.accepted_servers,
                ),
                rejected_prefixes: list(
                    "HARVEST_REJECTED_HANDLE_PREFIXES",
                    defaults.handle_policy.rejected_prefixes,
                ),
            },
        }
    }

    pub fn with_time_padding(mut self, padding: Duration) -> Self {
        self.time_padding = padding;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_alert_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.alert_recipient = Some(recipient.into());
        self
    }
}

/// Configuration of the worker process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub sources_file: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub run: RunConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            sources_file: std::env::var("HARVEST_SOURCES_FILE").ok().map(PathBuf::from),
            scheduler: SchedulerConfig::from_env(),
            run: RunConfig::from_env(),
        })
    }
}

/// Required fields per target collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationProfile {
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// The YAML file listing sources and collection profiles.
///
/// ```yaml
/// profiles:
///   theses:
///     required_fields: [dc.title, dc.contributor.author]
/// sources:
///   - source_id: uni-theses
///     base_url: https://repository.example.org/oai/request
///     set: col_1
///     collection: theses
///     metadata_format: dc
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ValidationProfile>,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl SourcesFile {
    pub fn parse(text: &str) -> Result<Self> {
        let file: Self = serde_yaml_ng::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// The profile for a collection; collections without one accept any record.
    #[must_use]
    pub fn profile(&self, collection: &str) -> ValidationProfile {
        self.profiles.get(collection).cloned().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                return Err(HarvestError::Config("source with empty source_id".into()));
            }
            if !seen.insert(source.source_id.as_str()) {
                return Err(HarvestError::Config(format!(
                    "duplicate source_id: {}",
                    source.source_id
                )));
            }
            oai_client::config::validate_base_url(&source.base_url).map_err(|e| {
                HarvestError::Config(format!("source {}: {e}", source.source_id))
            })?;
        }
        Ok(())
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}
