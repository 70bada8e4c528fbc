use std::sync::Arc;

use oai_client::OaiClient;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::{EngineConfig, SourcesFile};
use crate::controller::HarvestController;
use crate::crosswalk::MetadataFormatRegistry;
use crate::db;
use crate::error::{HarvestError, Result};
use crate::report::ReportSink;
use crate::scheduler::Scheduler;
use crate::store::{HarvestStore, PgStore};

/// Run the harvest worker.
///
/// Migrates the database, loads the configured sources and runs the
/// scheduler until SIGTERM or SIGINT (ctrl+c). Shutdown stops new runs and
/// waits for the ones in progress to finish.
pub async fn run_harvest_worker(config: EngineConfig) -> Result<()> {
    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    let sources = match &config.sources_file {
        Some(path) => SourcesFile::load(path)?,
        None => SourcesFile::default(),
    };
    for definition in &sources.sources {
        store.upsert_source(definition).await?;
    }

    let transport = Arc::new(OaiClient::from_env()?);

    tracing::info!(
        sources = sources.sources.len(),
        sources_file = ?config.sources_file,
        alert_recipient = ?config.run.alert_recipient,
        "starting harvest worker"
    );

    let reports = ReportSink::logging(config.run.alert_recipient.clone());
    let controller = HarvestController::new(store, transport)
        .with_registry(MetadataFormatRegistry::default())
        .with_profiles(sources.profiles)
        .with_run_config(config.run)
        .with_report_sink(reports);

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| HarvestError::Worker(format!("failed to register SIGTERM handler: {e}")))?;

    let scheduler = Scheduler::start_new_scheduler(Arc::new(controller), config.scheduler).await?;

    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, stopping worker");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, stopping worker");
        }
    }

    scheduler.shutdown().await;
    tracing::info!("harvest worker stopped");
    Ok(())
}
