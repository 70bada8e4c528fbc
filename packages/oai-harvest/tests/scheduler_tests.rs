mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer};

use oai_harvest::{
    HarvestController, HarvestStore, MemoryStore, RunOutcome, Scheduler, SchedulerConfig,
    SchedulerState, SourceDefinition, SourceStatus,
};

use common::*;

async fn repository(records: u32) -> MockServer {
    let server = MockServer::start().await;
    mount_dc_repository(&server).await;
    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("verb", "ListRecords"))
        .respond_with(xml(&list_records(
            &records_range(1, records, "2024-05-01T00:00:00Z"),
            None,
        )))
        .mount(&server)
        .await;
    server
}

async fn scheduler_with(
    server: &MockServer,
    source_ids: &[&str],
    config: SchedulerConfig,
) -> (Scheduler, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for id in source_ids {
        store
            .upsert_source(&SourceDefinition::new(*id, base_url(server), "theses", "dc"))
            .await
            .unwrap();
    }
    let controller = Arc::new(HarvestController::new(store.clone(), fast_client()));
    (Scheduler::new(controller, config), store)
}

fn config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_concurrency(2)
}

#[tokio::test]
async fn test_tick_respects_concurrency_limit() {
    let server = repository(3).await;
    let (scheduler, store) = scheduler_with(&server, &["a", "b", "c"], config()).await;

    let started = scheduler.tick().await.unwrap();
    assert_eq!(started, vec!["a", "b"]);
    scheduler.wait_idle().await;
    assert!(scheduler.active_sources().is_empty());

    // a and b are harvested and not due again; c gets its turn.
    let started = scheduler.tick().await.unwrap();
    assert_eq!(started, vec!["c"]);
    scheduler.wait_idle().await;

    for id in ["a", "b", "c"] {
        let source = store.get_source(id).await.unwrap();
        assert_eq!(source.last_outcome, Some(RunOutcome::Complete));
        assert!(source.last_harvest_at.is_some());
    }
    assert!(scheduler.tick().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let server = repository(1).await;
    let (scheduler, _store) = scheduler_with(&server, &["a"], config()).await;

    scheduler.pause_scheduler();
    assert_eq!(scheduler.state(), SchedulerState::Paused);
    assert!(scheduler.tick().await.unwrap().is_empty());

    scheduler.resume_scheduler();
    assert_eq!(scheduler.state(), SchedulerState::Running);
    assert_eq!(scheduler.tick().await.unwrap(), vec!["a"]);
    scheduler.wait_idle().await;
}

#[tokio::test]
async fn test_stopped_scheduler_starts_nothing() {
    let server = repository(1).await;
    let (scheduler, _store) = scheduler_with(&server, &["a"], config()).await;

    scheduler.stop_scheduler();
    scheduler.resume_scheduler();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(scheduler.tick().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queued_source_runs_again() {
    let server = repository(2).await;
    let (scheduler, store) = scheduler_with(&server, &["a"], config()).await;

    scheduler.tick().await.unwrap();
    scheduler.wait_idle().await;
    assert!(scheduler.tick().await.unwrap().is_empty());

    let queued = scheduler.queue_source("a").await.unwrap();
    assert_eq!(queued.status, SourceStatus::Queue);
    assert_eq!(scheduler.tick().await.unwrap(), vec!["a"]);
    scheduler.wait_idle().await;

    let runs = store.list_runs("a").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].records_skipped, 2);
    assert_eq!(store.get_source("a").await.unwrap().status, SourceStatus::Ready);
}

#[tokio::test]
async fn test_reset_forces_full_harvest() {
    let server = repository(1).await;
    let (scheduler, store) = scheduler_with(&server, &["a", "b"], config()).await;

    scheduler.tick().await.unwrap();
    scheduler.wait_idle().await;
    assert!(scheduler.tick().await.unwrap().is_empty());

    // Due at once, even though both were attempted within the retry delay.
    assert_eq!(scheduler.reset_scheduler().await.unwrap(), 2);
    let source = store.get_source("a").await.unwrap();
    assert_eq!(source.last_harvest_at, None);
    assert_eq!(source.last_attempt_at, None);
    assert_eq!(scheduler.tick().await.unwrap(), vec!["a", "b"]);
    scheduler.wait_idle().await;
    assert!(store.get_source("a").await.unwrap().last_harvest_at.is_some());
}

#[tokio::test]
async fn test_reset_during_run_keeps_harvest_date_cleared() {
    let server = MockServer::start().await;
    mount_dc_repository(&server).await;
    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("verb", "ListRecords"))
        .respond_with(
            xml(&list_records(
                &records_range(1, 2, "2024-05-01T00:00:00Z"),
                None,
            ))
            .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let (scheduler, store) = scheduler_with(&server, &["a"], config()).await;
    scheduler.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.active_sources(), vec!["a"]);

    scheduler.reset_scheduler().await.unwrap();
    scheduler.wait_idle().await;

    // The run completes but its window predates the reset.
    let source = store.get_source("a").await.unwrap();
    assert_eq!(source.last_outcome, Some(RunOutcome::Complete));
    assert_eq!(source.last_harvest_at, None);

    // The next run is a full harvest and records its date again.
    assert_eq!(scheduler.tick().await.unwrap(), vec!["a"]);
    scheduler.wait_idle().await;
    let runs = store.list_runs("a").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(
        store.get_source("a").await.unwrap().last_harvest_at,
        Some(runs[0].started_at)
    );
}

#[tokio::test]
async fn test_failed_source_is_retried_after_delay() {
    let server = MockServer::start().await;
    mount_dc_repository(&server).await;
    mount_first_page(&server, oai_error("badArgument", "bad from"), 2).await;

    let (scheduler, store) =
        scheduler_with(&server, &["a"], config().with_retry_delay(Duration::ZERO)).await;

    scheduler.tick().await.unwrap();
    scheduler.wait_idle().await;
    let source = store.get_source("a").await.unwrap();
    assert_eq!(source.last_outcome, Some(RunOutcome::Failed));
    assert_eq!(source.status, SourceStatus::Ready);

    assert_eq!(scheduler.tick().await.unwrap(), vec!["a"]);
    scheduler.wait_idle().await;
    assert_eq!(store.list_runs("a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_source_waits_for_retry_delay() {
    let server = MockServer::start().await;
    mount_dc_repository(&server).await;
    mount_first_page(&server, oai_error("badArgument", "bad from"), 1).await;

    let (scheduler, _store) = scheduler_with(&server, &["a"], config()).await;
    scheduler.tick().await.unwrap();
    scheduler.wait_idle().await;

    assert!(scheduler.tick().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_source_is_never_started() {
    let server = repository(1).await;
    let (scheduler, store) = scheduler_with(&server, &["a", "b"], config()).await;
    store
        .set_source_status("a", SourceStatus::Disabled)
        .await
        .unwrap();

    assert_eq!(scheduler.tick().await.unwrap(), vec!["b"]);
    scheduler.wait_idle().await;
    assert!(store.list_runs("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_abort_runs_ends_run_aborted() {
    let server = MockServer::start().await;
    mount_dc_repository(&server).await;
    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("verb", "ListRecords"))
        .respond_with(
            xml(&list_records(
                &records_range(1, 3, "2024-05-01T00:00:00Z"),
                None,
            ))
            .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let (scheduler, store) = scheduler_with(&server, &["a"], config()).await;
    scheduler.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.active_sources(), vec!["a"]);

    scheduler.abort_runs();
    scheduler.wait_idle().await;

    let runs = store.list_runs("a").await.unwrap();
    assert_eq!(runs[0].outcome, Some(RunOutcome::Aborted));
    assert_eq!(runs[0].records_processed, 0);
    assert_eq!(store.get_source("a").await.unwrap().last_harvest_at, None);
}

#[tokio::test]
async fn test_start_recovers_interrupted_runs() {
    let server = repository(1).await;
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(&SourceDefinition::new("a", base_url(&server), "theses", "dc"))
        .await
        .unwrap();

    // A run left open by a process that died.
    store.claim_source("a").await.unwrap().unwrap();
    store.create_run("a", Utc::now()).await.unwrap();

    let controller = Arc::new(HarvestController::new(store.clone(), fast_client()));
    let scheduler = Scheduler::start_new_scheduler(controller, config())
        .await
        .unwrap();

    // The orphaned source is claimable and due on the first cycle.
    let mut attempts = 0;
    while store.list_runs("a").await.unwrap().len() < 2 && attempts < 50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        attempts += 1;
    }
    scheduler.shutdown().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    let runs = store.list_runs("a").await.unwrap();
    assert_eq!(runs.len(), 2);
    let interrupted = runs.last().unwrap();
    assert_eq!(interrupted.outcome, Some(RunOutcome::Aborted));
    assert_eq!(runs[0].outcome, Some(RunOutcome::Complete));
    assert_eq!(store.get_source("a").await.unwrap().status, SourceStatus::Ready);
}
