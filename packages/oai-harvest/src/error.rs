use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("harvest source not found: {0}")]
    SourceNotFound(String),

    #[error("harvest run not found: {0}")]
    RunNotFound(uuid::Uuid),

    #[error("harvest source {0} already has an active run")]
    SourceBusy(String),

    #[error("harvest source {0} is disabled")]
    SourceDisabled(String),

    #[error("handle {handle} is already assigned to object {existing}")]
    HandleCollision {
        handle: String,
        existing: uuid::Uuid,
    },

    #[error("record {oai_identifier} from source {source_id} is already linked")]
    DuplicateLink {
        source_id: String,
        oai_identifier: String,
    },

    #[error("no link for record {oai_identifier} from source {source_id}")]
    LinkNotFound {
        source_id: String,
        oai_identifier: String,
    },

    #[error("OAI-PMH error: {0}")]
    Oai(#[from] oai_client::OaiError),

    /// Error fetching the ORE resource map of a single record.
    #[error("ORE resource map for {oai_identifier}: {source}")]
    Ore {
        oai_identifier: String,
        #[source]
        source: oai_client::OaiError,
    },

    #[error("metadata format {format} is not supported by {base_url}")]
    FormatNotSupported { format: String, base_url: String },

    #[error("crosswalk error: {0}")]
    Crosswalk(String),

    #[error("run exceeded its time limit of {limit_secs}s")]
    RunExpired { limit_secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker error: {0}")]
    Worker(String),
}

impl HarvestError {
    /// Errors that concern one record and are isolated to it; everything
    /// else fails the run.
    #[must_use]
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::HandleCollision { .. }
                | Self::DuplicateLink { .. }
                | Self::Crosswalk(_)
                | Self::Ore { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
