//! PostgreSQL store tests. They start a database container, so they need a
//! Docker daemon: `cargo test -- --ignored`.

mod common;

use chrono::Utc;
use pretty_assertions::assert_eq;

use oai_harvest::models::{external_id, MetadataValue, NewObject, ObjectUpdate, RunCounts};
use oai_harvest::{
    HarvestError, HarvestMode, HarvestStore, PgStore, RunOutcome, SourceDefinition, SourceStatus,
};

use common::TestDb;

fn definition(id: &str) -> SourceDefinition {
    SourceDefinition::new(id, "https://repo.example.org/oai", "theses", "dc")
        .with_set("col_1")
        .with_mode(HarvestMode::MetadataAndRefs)
}

fn new_object(source_id: &str, oai_identifier: &str, handle: Option<&str>) -> NewObject {
    NewObject {
        source_id: source_id.to_string(),
        oai_identifier: oai_identifier.to_string(),
        collection: "theses".to_string(),
        handle: handle.map(str::to_string),
        metadata: vec![MetadataValue::new("dc", "title", None, "A title")],
        ore_document: None,
        content_links: vec![],
        remote_datestamp: "2024-05-01T00:00:00Z".to_string(),
        content_hash: "abc".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_keeps_runtime_state() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());

    let created = store.upsert_source(&definition("a")).await.unwrap();
    assert_eq!(created.status, SourceStatus::Ready);
    assert_eq!(created.harvest_mode, HarvestMode::MetadataAndRefs);
    assert_eq!(created.effective_set(), Some("col_1"));

    store.claim_source("a").await.unwrap().unwrap();
    let updated = store
        .upsert_source(&definition("a").with_set("all"))
        .await
        .unwrap();
    assert_eq!(updated.status, SourceStatus::Busy);
    assert_eq!(updated.effective_set(), None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_claim_is_exclusive() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();

    let (first, second) = tokio::join!(store.claim_source("a"), store.claim_source("a"));
    let claimed = [first.unwrap(), second.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(claimed, 1);

    let busy = store.set_source_status("a", SourceStatus::Queue).await;
    assert!(matches!(busy, Err(HarvestError::SourceBusy(_))));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_run_lifecycle_and_release() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();
    store.claim_source("a").await.unwrap().unwrap();

    let started_at = Utc::now();
    let run = store.create_run("a", started_at).await.unwrap();
    assert!(run.is_open());
    assert!(matches!(
        store.create_run("a", started_at).await,
        Err(HarvestError::SourceBusy(_))
    ));

    let counts = RunCounts {
        processed: 3,
        created: 2,
        rejected: 1,
        ..RunCounts::default()
    };
    store
        .record_run_progress(run.id, Some("token-2"), &counts)
        .await
        .unwrap();
    let progressed = store.get_run(run.id).await.unwrap();
    assert_eq!(progressed.cursor.as_deref(), Some("token-2"));

    let finished = store
        .finish_run(run.id, RunOutcome::CompleteWithErrors, &counts, None)
        .await
        .unwrap();
    assert_eq!(finished.cursor, None);
    assert_eq!(finished.counts(), counts);

    let source = store
        .release_source("a", RunOutcome::CompleteWithErrors, started_at, None)
        .await
        .unwrap();
    assert_eq!(source.status, SourceStatus::Ready);
    assert!(source.last_harvest_at.is_some());
    assert_eq!(store.list_runs("a").await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failed_release_keeps_harvest_date() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();

    store.claim_source("a").await.unwrap().unwrap();
    let source = store
        .release_source("a", RunOutcome::Failed, Utc::now(), Some("boom"))
        .await
        .unwrap();
    assert_eq!(source.last_harvest_at, None);
    assert_eq!(source.last_outcome, Some(RunOutcome::Failed));
    assert_eq!(source.last_message.as_deref(), Some("boom"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_object_create_update_withdraw() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();

    let (object, link) = store
        .create_object(new_object("a", "oai:repo:1", Some("10411/1")))
        .await
        .unwrap();
    assert_eq!(object.external_id, external_id("a", "oai:repo:1"));
    assert_eq!(link.object_id, object.id);

    assert!(matches!(
        store.create_object(new_object("a", "oai:repo:1", None)).await,
        Err(HarvestError::DuplicateLink { .. })
    ));
    assert!(matches!(
        store
            .create_object(new_object("a", "oai:repo:2", Some("10411/1")))
            .await,
        Err(HarvestError::HandleCollision { .. })
    ));

    let withdrawn = store
        .mark_withdrawn("a", "oai:repo:1", "2024-05-02T00:00:00Z")
        .await
        .unwrap();
    assert!(withdrawn.tombstoned);
    assert!(store.get_object(object.id).await.unwrap().withdrawn);

    let (updated, link) = store
        .update_object_metadata(
            "a",
            "oai:repo:1",
            ObjectUpdate {
                metadata: vec![MetadataValue::new("dc", "title", None, "Revised")],
                ore_document: Some("<entry/>".into()),
                content_links: vec!["http://repo/file.pdf".into()],
                remote_datestamp: "2024-05-03T00:00:00Z".into(),
                content_hash: "def".into(),
            },
        )
        .await
        .unwrap();
    assert!(!updated.withdrawn);
    assert!(!link.tombstoned);
    assert_eq!(updated.values("dc.title").collect::<Vec<_>>(), vec!["Revised"]);
    assert_eq!(link.content_hash.as_deref(), Some("def"));
    assert_eq!(store.count_links("a").await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_recover_interrupted() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();
    store.upsert_source(&definition("b")).await.unwrap();

    store.claim_source("a").await.unwrap().unwrap();
    let run = store.create_run("a", Utc::now()).await.unwrap();

    let recovered = store.recover_interrupted().await.unwrap();
    assert_eq!(recovered, vec!["a".to_string()]);

    let run = store.get_run(run.id).await.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::Aborted));
    assert_eq!(
        store.get_source("a").await.unwrap().status,
        SourceStatus::Orphaned
    );
    assert!(store.claim_source("a").await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_sources_claiming_one_handle() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();
    store.upsert_source(&definition("b")).await.unwrap();

    let (first, second) = tokio::join!(
        store.create_object(new_object("a", "oai:a:1", Some("10411/7"))),
        store.create_object(new_object("b", "oai:b:1", Some("10411/7"))),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(HarvestError::HandleCollision { handle, .. }) if handle == "10411/7")));
    assert_eq!(
        store.count_links("a").await.unwrap() + store.count_links("b").await.unwrap(),
        1
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reset_while_busy_is_not_undone_by_release() {
    let db = TestDb::new().await;
    let store = PgStore::new(db.pool.clone());
    store.upsert_source(&definition("a")).await.unwrap();

    let started_at = Utc::now();
    store.claim_source("a").await.unwrap().unwrap();
    assert_eq!(store.reset_harvest_dates().await.unwrap(), 1);

    let source = store
        .release_source("a", RunOutcome::Complete, started_at, None)
        .await
        .unwrap();
    assert_eq!(source.last_harvest_at, None);
    assert_eq!(source.last_attempt_at, None);

    store.claim_source("a").await.unwrap().unwrap();
    let source = store
        .release_source("a", RunOutcome::Complete, Utc::now(), None)
        .await
        .unwrap();
    assert!(source.last_harvest_at.is_some());
}
