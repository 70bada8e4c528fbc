//! Periodic evaluation of due sources.
//!
//! The scheduler polls storage every `poll_interval`, starts a run for each
//! due source up to the concurrency limit and never holds two runs for one
//! source: the in-process active set skips sources it already runs, and the
//! storage claim turns away anything another process holds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use strum::Display;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::controller::HarvestController;
use crate::error::{HarvestError, Result};
use crate::models::{HarvestSource, SourceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SchedulerState {
    Running,
    /// No new runs; runs in progress continue.
    Paused,
    /// The polling loop has ended.
    Stopped,
}

/// Whether `source` should be harvested at `now`.
///
/// Queued and orphaned sources are always due. A ready source is due once
/// its harvest interval has passed since the last successful run and its
/// retry delay has passed since the last attempt of any outcome.
#[must_use]
pub fn is_due(source: &HarvestSource, now: DateTime<Utc>, config: &SchedulerConfig) -> bool {
    let elapsed = |since: Option<DateTime<Utc>>, wait: std::time::Duration| match since {
        None => true,
        Some(t) => (now - t).to_std().is_ok_and(|d| d >= wait),
    };

    match source.status {
        SourceStatus::Queue | SourceStatus::Orphaned => true,
        SourceStatus::Ready => {
            elapsed(source.last_harvest_at, config.harvest_interval)
                && elapsed(source.last_attempt_at, config.retry_delay)
        }
        SourceStatus::Busy | SourceStatus::Disabled => false,
    }
}

struct Shared {
    controller: Arc<HarvestController>,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    permits: Arc<Semaphore>,
    active: Mutex<HashSet<String>>,
    abort: Mutex<CancellationToken>,
    runs: TaskTracker,
}

/// Removes a source from the active set when its run task ends.
struct ActiveGuard {
    shared: Arc<Shared>,
    source_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.shared.active.lock() {
            active.remove(&self.source_id);
        }
    }
}

/// Handle to a scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    poll_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// A scheduler in the RUNNING state without a polling loop.
    /// Call [`Scheduler::tick`] to evaluate sources by hand.
    pub fn new(controller: Arc<HarvestController>, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Running);
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            shared: Arc::new(Shared {
                controller,
                config,
                state,
                permits,
                active: Mutex::new(HashSet::new()),
                abort: Mutex::new(CancellationToken::new()),
                runs: TaskTracker::new(),
            }),
            poll_loop: Arc::new(Mutex::new(None)),
        }
    }

    /// Recover runs interrupted by a previous process and start polling.
    pub async fn start_new_scheduler(
        controller: Arc<HarvestController>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let orphaned = controller.store().recover_interrupted().await?;
        if !orphaned.is_empty() {
            tracing::warn!(sources = ?orphaned, "recovered interrupted harvest runs");
        }

        let scheduler = Self::new(controller, config);
        tracing::info!(
            poll_interval = ?scheduler.shared.config.poll_interval,
            concurrency = scheduler.shared.config.concurrency,
            harvest_interval = ?scheduler.shared.config.harvest_interval,
            "starting harvest scheduler"
        );

        let handle = tokio::spawn(poll_loop(scheduler.clone()));
        if let Ok(mut slot) = scheduler.poll_loop.lock() {
            *slot = Some(handle);
        }
        Ok(scheduler)
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    pub fn pause_scheduler(&self) {
        self.transition(SchedulerState::Running, SchedulerState::Paused);
    }

    pub fn resume_scheduler(&self) {
        self.transition(SchedulerState::Paused, SchedulerState::Running);
    }

    /// Stop issuing runs. Runs in progress are left to finish.
    pub fn stop_scheduler(&self) {
        self.shared.state.send_if_modified(|state| {
            let changed = *state != SchedulerState::Stopped;
            *state = SchedulerState::Stopped;
            changed
        });
        tracing::info!("harvest scheduler stopped");
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) {
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(state = %to, "harvest scheduler state changed");
        }
    }

    /// Forget all last-harvest times so every source is harvested in full
    /// on its next run. Sources become due at once; a run in flight keeps going
    /// but does not record its start as the new harvest date.
    pub async fn reset_scheduler(&self) -> Result<u64> {
        let reset = self.shared.controller.store().reset_harvest_dates().await?;
        tracing::warn!(sources = reset, "harvest dates reset, next runs are full harvests");
        Ok(reset)
    }

    /// Make a source due on the next cycle.
    pub async fn queue_source(&self, source_id: &str) -> Result<HarvestSource> {
        self.shared
            .controller
            .store()
            .set_source_status(source_id, SourceStatus::Queue)
            .await
    }

    /// Cancel the runs in progress. They end ABORTED after their current
    /// record; later runs are unaffected.
    pub fn abort_runs(&self) {
        if let Ok(mut token) = self.shared.abort.lock() {
            token.cancel();
            *token = CancellationToken::new();
        }
        tracing::warn!("abort requested for running harvests");
    }

    /// Ids of the sources this scheduler is running.
    #[must_use]
    pub fn active_sources(&self) -> Vec<String> {
        self.shared
            .active
            .lock()
            .map(|a| {
                let mut ids: Vec<String> = a.iter().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Evaluate sources once and start runs for the due ones. Returns the
    /// ids of the sources started.
    pub async fn tick(&self) -> Result<Vec<String>> {
        if self.state() != SchedulerState::Running {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let sources = self.shared.controller.store().list_sources().await?;
        let mut started = Vec::new();

        for source in sources
            .iter()
            .filter(|s| is_due(s, now, &self.shared.config))
        {
            let Ok(permit) = Arc::clone(&self.shared.permits).try_acquire_owned() else {
                tracing::debug!("concurrency limit reached");
                break;
            };

            let newly_active = self
                .shared
                .active
                .lock()
                .map_err(|_| HarvestError::Worker("active set poisoned".into()))?
                .insert(source.source_id.clone());
            if !newly_active {
                tracing::debug!(source_id = %source.source_id, "source already running, skipped");
                continue;
            }

            let guard = ActiveGuard {
                shared: Arc::clone(&self.shared),
                source_id: source.source_id.clone(),
            };
            let cancel = self
                .shared
                .abort
                .lock()
                .map_err(|_| HarvestError::Worker("abort token poisoned".into()))?
                .clone();
            let controller = Arc::clone(&self.shared.controller);

            self.shared.runs.spawn(async move {
                let _permit = permit;
                match controller.run(&guard.source_id, cancel).await {
                    Ok(run) => {
                        tracing::debug!(run_id = %run.id, outcome = ?run.outcome, "run task done");
                    }
                    Err(HarvestError::SourceBusy(id) | HarvestError::SourceDisabled(id)) => {
                        tracing::debug!(source_id = %id, "source not claimable, skipped");
                    }
                    Err(e) => {
                        tracing::error!(source_id = %guard.source_id, error = %e, "harvest run could not start");
                    }
                }
            });
            started.push(source.source_id.clone());
        }

        Ok(started)
    }

    /// Wait until every run started so far has ended.
    pub async fn wait_idle(&self) {
        self.shared.runs.close();
        self.shared.runs.wait().await;
        self.shared.runs.reopen();
    }

    /// Stop the scheduler and wait for the polling loop and all runs.
    pub async fn shutdown(&self) {
        self.stop_scheduler();
        let handle = self.poll_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        tracing::info!(active = ?self.active_sources(), "waiting for running harvests");
        self.wait_idle().await;
    }
}

async fn poll_loop(scheduler: Scheduler) {
    let mut state = scheduler.shared.state.subscribe();
    loop {
        match scheduler.state() {
            SchedulerState::Stopped => break,
            SchedulerState::Paused => {}
            SchedulerState::Running => match scheduler.tick().await {
                Ok(started) if !started.is_empty() => {
                    tracing::info!(sources = ?started, "harvest runs started");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "scheduler cycle failed"),
            },
        }

        // A state change (resume, stop) ends the wait early.
        tokio::select! {
            _ = tokio::time::sleep(scheduler.shared.config.poll_interval) => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HarvestMode, RunOutcome};
    use chrono::Duration;

    fn source(status: SourceStatus) -> HarvestSource {
        let now = Utc::now();
        HarvestSource {
            source_id: "s".into(),
            base_url: "http://repo/oai".into(),
            set_spec: None,
            collection: "c".into(),
            metadata_format: "dc".into(),
            harvest_mode: HarvestMode::MetadataOnly,
            status,
            last_harvest_at: None,
            last_outcome: None,
            last_attempt_at: None,
            last_message: None,
            reset_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_never_harvested_is_due() {
        let config = SchedulerConfig::default();
        assert!(is_due(&source(SourceStatus::Ready), Utc::now(), &config));
        assert!(is_due(&source(SourceStatus::Orphaned), Utc::now(), &config));
        assert!(!is_due(&source(SourceStatus::Busy), Utc::now(), &config));
        assert!(!is_due(&source(SourceStatus::Disabled), Utc::now(), &config));
    }

    #[test]
    fn test_interval_and_retry_delay() {
        let config = SchedulerConfig::default();
        let now = Utc::now();

        let mut recent = source(SourceStatus::Ready);
        recent.last_harvest_at = Some(now - Duration::hours(1));
        recent.last_attempt_at = Some(now - Duration::hours(1));
        assert!(!is_due(&recent, now, &config));

        let mut stale = source(SourceStatus::Ready);
        stale.last_harvest_at = Some(now - Duration::hours(13));
        stale.last_attempt_at = Some(now - Duration::hours(13));
        assert!(is_due(&stale, now, &config));

        // Failed a minute ago: wait for the retry delay.
        let mut failed = stale.clone();
        failed.last_outcome = Some(RunOutcome::Failed);
        failed.last_attempt_at = Some(now - Duration::minutes(1));
        assert!(!is_due(&failed, now, &config));
        failed.last_attempt_at = Some(now - Duration::minutes(16));
        assert!(is_due(&failed, now, &config));
    }

    #[test]
    fn test_queued_source_is_due() {
        let mut queued = source(SourceStatus::Queue);
        queued.last_harvest_at = Some(Utc::now());
        queued.last_attempt_at = Some(Utc::now());
        assert!(is_due(&queued, Utc::now(), &SchedulerConfig::default()));
    }
}
