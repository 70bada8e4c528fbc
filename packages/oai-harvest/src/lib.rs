//! Scheduled, incremental OAI-PMH harvesting into a local object store.
//!
//! - [`scheduler`]: decides when each source is due and runs it
//! - [`controller`]: one harvest run, page by page
//! - [`validator`] and [`crosswalk`]: record acceptance and metadata mapping
//! - [`reconciler`]: creates, updates or withdraws local objects
//! - [`store`]: storage contract with PostgreSQL and in-memory backends
//! - [`report`]: run reports and notifications
//! - [`verify`]: checks a source configuration against its repository

pub mod config;
pub mod controller;
pub mod crosswalk;
pub mod db;
pub mod error;
pub mod models;
pub mod reconciler;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod validator;
pub mod verify;
pub mod worker;

pub use config::{EngineConfig, RunConfig, SchedulerConfig, SourcesFile, ValidationProfile};
pub use controller::HarvestController;
pub use db::{create_pool, run_migrations};
pub use error::{HarvestError, Result};
pub use models::{
    HarvestMode, HarvestRun, HarvestSource, HarvestedRecordLink, LocalObject, MetadataValue,
    RunCounts, RunOutcome, SourceDefinition, SourceStatus,
};
pub use report::{Notifier, ReportSink, RunReport};
pub use scheduler::{Scheduler, SchedulerState};
pub use store::{HarvestStore, MemoryStore, PgStore};
pub use verify::{verify_source, VerifyProblem};
