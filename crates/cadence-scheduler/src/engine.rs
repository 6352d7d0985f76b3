use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    sink::{DispatchError, DispatchSink},
    store::JobStore,
    types::Job,
};

/// Runtime knobs of the scheduler loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub enqueue_timeout: Duration,
    pub max_concurrent_dispatch: usize,
    /// Consecutive failed scans before the loop halts.
    pub max_store_failures: u32,
    /// Occurrences claimed later than this are advanced but not enqueued.
    pub misfire_grace: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            enqueue_timeout: cfg.enqueue_timeout(),
            max_concurrent_dispatch: cfg.max_concurrent_dispatch.max(1),
            max_store_failures: cfg.max_store_failures.max(1),
            misfire_grace: cfg.misfire_grace(),
        }
    }
}

/// Where the loop currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Scanning,
    Dispatching,
    /// Shut down on request.
    Stopped,
    /// Halted on a broken store.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Scanning => "scanning",
            EngineState::Dispatching => "dispatching",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot published on the engine's health channel.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub state: EngineState,
    pub healthy: bool,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_store_failures: u32,
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self {
            state: EngineState::Idle,
            healthy: true,
            ticks: 0,
            last_tick_at: None,
            last_error: None,
            consecutive_store_failures: 0,
        }
    }
}

/// Per-tick counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Jobs returned by the due scan.
    pub due: usize,
    pub dispatched: usize,
    /// Claims lost to another scheduler instance.
    pub already_claimed: usize,
    /// Claims that failed, or enqueues that failed or timed out.
    pub failed: usize,
    /// Occurrences older than the misfire grace; advanced without dispatch.
    pub missed: usize,
    /// Due jobs left unclaimed because shutdown was requested.
    pub abandoned: usize,
}

enum Outcome {
    Dispatched,
    AlreadyClaimed,
    Gone,
    Failed,
    Missed,
    Abandoned,
    Fatal(SchedulerError),
}

/// The scheduler context: owns the store and sink handles and drives ticks
/// until shutdown.
pub struct SchedulerEngine {
    store: Arc<JobStore>,
    sink: Arc<dyn DispatchSink>,
    config: EngineConfig,
    health: watch::Sender<EngineHealth>,
}

impl SchedulerEngine {
    pub fn new(store: Arc<JobStore>, sink: Arc<dyn DispatchSink>, config: EngineConfig) -> Self {
        let (health, _) = watch::channel(EngineHealth::default());
        Self {
            store,
            sink,
            config,
            health,
        }
    }

    /// Subscribe to health snapshots. Stays readable after the engine stops.
    pub fn health(&self) -> watch::Receiver<EngineHealth> {
        self.health.subscribe()
    }

    /// Main event loop. Ticks every `poll_interval` until `shutdown` broadcasts
    /// `true`, or until the store is judged broken, in which case the store
    /// error is returned and health reports `failed`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            namespace = %self.store.namespace(),
            poll_secs = self.config.poll_interval.as_secs_f64(),
            "scheduler engine started"
        );

        match self.store.reschedule_enabled(Utc::now()) {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(self.halt(e)),
            Err(e) => warn!(error = %e, "startup reschedule failed"),
        }

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let now = Utc::now();
                    match self.tick(now, &shutdown).await {
                        Ok(report) => {
                            failures = 0;
                            self.health.send_modify(|h| {
                                h.state = EngineState::Idle;
                                h.ticks += 1;
                                h.last_tick_at = Some(now);
                                h.consecutive_store_failures = 0;
                            });
                            if report.due > 0 {
                                info!(
                                    due = report.due,
                                    dispatched = report.dispatched,
                                    already_claimed = report.already_claimed,
                                    failed = report.failed,
                                    missed = report.missed,
                                    abandoned = report.abandoned,
                                    "tick complete"
                                );
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            error!(error = %e, code = e.code(), failures, "scheduler tick failed");
                            if e.is_fatal() || failures >= self.config.max_store_failures {
                                return Err(self.halt(e));
                            }
                            self.health.send_modify(|h| {
                                h.state = EngineState::Idle;
                                h.ticks += 1;
                                h.last_tick_at = Some(now);
                                h.last_error = Some(e.to_string());
                                h.consecutive_store_failures = failures;
                            });
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(EngineState::Stopped);
        info!("scheduler engine shutting down");
        Ok(())
    }

    /// One scan-claim-dispatch pass at `now`.
    ///
    /// Per-job failures are logged and counted; only a failed scan or a
    /// fatal store error during a claim is returned as `Err`.
    pub async fn tick(&self, now: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> Result<TickReport> {
        self.set_state(EngineState::Scanning);
        let due = self.store.due_before(now)?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            self.set_state(EngineState::Idle);
            return Ok(report);
        }

        self.set_state(EngineState::Dispatching);
        let outcomes: Vec<Outcome> = stream::iter(due)
            .map(|job| self.process(job, now, shutdown))
            .buffer_unordered(self.config.max_concurrent_dispatch.max(1))
            .collect()
            .await;

        let mut fatal = None;
        for outcome in outcomes {
            match outcome {
                Outcome::Dispatched => report.dispatched += 1,
                Outcome::AlreadyClaimed => report.already_claimed += 1,
                Outcome::Gone => {}
                Outcome::Failed => report.failed += 1,
                Outcome::Missed => report.missed += 1,
                Outcome::Abandoned => report.abandoned += 1,
                Outcome::Fatal(e) => {
                    report.failed += 1;
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        self.set_state(EngineState::Idle);
        Ok(report)
    }

    /// Claim one due job and hand its payload to the sink.
    async fn process(&self, job: Job, now: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> Outcome {
        if *shutdown.borrow() {
            debug!(job_id = %job.id, "shutdown requested; leaving job unclaimed");
            return Outcome::Abandoned;
        }

        // the claim may wait up to the busy timeout on another writer
        let store = Arc::clone(&self.store);
        let id = job.id.clone();
        let claimed = tokio::task::spawn_blocking(move || store.claim_and_advance(&id, now)).await;
        let claimed = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "claim task panicked");
                return Outcome::Failed;
            }
        };

        let claim = match claimed {
            Ok(claim) => claim,
            Err(SchedulerError::AlreadyClaimed { .. }) => {
                debug!(job_id = %job.id, "occurrence already claimed");
                return Outcome::AlreadyClaimed;
            }
            Err(SchedulerError::NotFound { .. }) => {
                debug!(job_id = %job.id, "job removed before claim");
                return Outcome::Gone;
            }
            Err(e) if e.is_fatal() => return Outcome::Fatal(e),
            Err(e) => {
                error!(job_id = %job.id, error = %e, code = e.code(), "claim failed");
                return Outcome::Failed;
            }
        };

        let drift_ms = (now - claim.scheduled_for).num_milliseconds();
        if claim.skipped > 0 {
            warn!(job_id = %job.id, name = %job.name, skipped = claim.skipped, "missed occurrences dropped");
        }
        if let Some(grace) = self.config.misfire_grace {
            if drift_ms > duration_ms(grace) {
                warn!(
                    job_id = %job.id,
                    name = %job.name,
                    scheduled_for = %claim.scheduled_for,
                    drift_ms,
                    "occurrence past misfire grace; not dispatched"
                );
                return Outcome::Missed;
            }
        }
        if drift_ms > duration_ms(self.config.poll_interval) {
            warn!(job_id = %job.id, name = %job.name, drift_ms, "dispatch running late");
        }

        let enqueue = self.sink.enqueue(&claim.payload, claim.scheduled_for);
        let result = match tokio::time::timeout(self.config.enqueue_timeout, enqueue).await {
            Ok(res) => res.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::Timeout(self.config.enqueue_timeout)),
        };

        match result {
            Ok(execution_id) => {
                info!(
                    job_id = %job.id,
                    name = %job.name,
                    %execution_id,
                    scheduled_for = %claim.scheduled_for,
                    drift_ms,
                    next_run_at = ?claim.job.next_run_at,
                    "job dispatched"
                );
                Outcome::Dispatched
            }
            Err(e) => {
                // The occurrence stays consumed: no replay.
                error!(
                    job_id = %job.id,
                    name = %job.name,
                    scheduled_for = %claim.scheduled_for,
                    error = %e,
                    code = e.code(),
                    "dispatch failed"
                );
                Outcome::Failed
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        self.health.send_modify(|h| h.state = state);
    }

    fn halt(&self, e: SchedulerError) -> SchedulerError {
        error!(error = %e, code = e.code(), "store unusable; scheduler halted");
        self.health.send_modify(|h| {
            h.state = EngineState::Failed;
            h.healthy = false;
            h.last_error = Some(e.to_string());
            h.consecutive_store_failures += 1;
        });
        e
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sink::{ChannelSink, SinkError};
    use crate::store::StoreOptions;
    use crate::types::{IntervalUnit, NewJob, Schedule};
    use async_trait::async_trait;
    use cadence_core::types::ExecutionId;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rusqlite::Connection;

    fn store() -> Arc<JobStore> {
        Arc::new(JobStore::new(Connection::open_in_memory().unwrap(), StoreOptions::default()).unwrap())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(10),
            enqueue_timeout: Duration::from_millis(50),
            max_concurrent_dispatch: 4,
            max_store_failures: 2,
            misfire_grace: None,
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    /// Sink that fails or stalls on demand and records what it saw.
    struct ScriptedSink {
        mode: SinkMode,
        seen: Mutex<Vec<DateTime<Utc>>>,
    }

    enum SinkMode {
        Accept,
        Refuse,
        Stall,
    }

    impl ScriptedSink {
        fn new(mode: SinkMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DispatchSink for ScriptedSink {
        async fn enqueue(
            &self,
            _payload: &[u8],
            scheduled_for: DateTime<Utc>,
        ) -> std::result::Result<ExecutionId, SinkError> {
            self.seen.lock().unwrap().push(scheduled_for);
            match self.mode {
                SinkMode::Accept => Ok(ExecutionId::new()),
                SinkMode::Refuse => Err(SinkError::Unavailable("broker down".into())),
                SinkMode::Stall => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(ExecutionId::new())
                }
            }
        }
    }

    #[tokio::test]
    async fn due_job_is_dispatched_and_advanced() {
        let store = store();
        let job = store
            .create_at(NewJob::new("a", Schedule::every(10, IntervalUnit::Seconds), b"p".to_vec()), t0())
            .unwrap();
        let (sink, mut rx) = ChannelSink::new(8, 1024);
        let engine = SchedulerEngine::new(store.clone(), Arc::new(sink), config());

        let now = t0() + ChronoDuration::seconds(10);
        let report = engine.tick(now, &no_shutdown()).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"p");
        assert_eq!(msg.scheduled_for, now);
        assert_eq!(store.get(&job.id).unwrap().next_run_at, Some(now + ChronoDuration::seconds(10)));
    }

    #[tokio::test]
    async fn failed_enqueue_is_not_replayed() {
        let store = store();
        let job = store
            .create_at(NewJob::new("a", Schedule::every(10, IntervalUnit::Seconds), Vec::new()), t0())
            .unwrap();
        let sink = ScriptedSink::new(SinkMode::Refuse);
        let engine = SchedulerEngine::new(store.clone(), sink.clone(), config());

        let now = t0() + ChronoDuration::seconds(10);
        let first = engine.tick(now, &no_shutdown()).await.unwrap();
        assert_eq!(first.failed, 1);

        let stored = store.get(&job.id).unwrap();
        assert_eq!(stored.last_enqueued_at, Some(now));
        assert_eq!(stored.next_run_at, Some(now + ChronoDuration::seconds(10)));

        let second = engine.tick(now, &no_shutdown()).await.unwrap();
        assert_eq!(second, TickReport::default());
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn stalled_enqueue_times_out_without_blocking_others() {
        let store = store();
        for name in ["a", "b", "c"] {
            store
                .create_at(NewJob::new(name, Schedule::every(10, IntervalUnit::Seconds), Vec::new()), t0())
                .unwrap();
        }
        let sink = ScriptedSink::new(SinkMode::Stall);
        let engine = SchedulerEngine::new(store.clone(), sink.clone(), config());

        let report = engine
            .tick(t0() + ChronoDuration::seconds(10), &no_shutdown())
            .await
            .unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn occurrence_past_grace_is_missed() {
        let store = store();
        store
            .create_at(NewJob::new("a", Schedule::every(1, IntervalUnit::Hours), Vec::new()), t0())
            .unwrap();
        let sink = ScriptedSink::new(SinkMode::Accept);
        let engine = SchedulerEngine::new(
            store.clone(),
            sink.clone(),
            EngineConfig {
                misfire_grace: Some(Duration::from_secs(60)),
                ..config()
            },
        );

        let report = engine
            .tick(t0() + ChronoDuration::hours(3), &no_shutdown())
            .await
            .unwrap();
        assert_eq!(report.missed, 1);
        assert_eq!(sink.calls(), 0);
        assert!(store.due_before(t0() + ChronoDuration::hours(3)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_abandons_unclaimed_jobs() {
        let store = store();
        let job = store
            .create_at(NewJob::new("a", Schedule::every(10, IntervalUnit::Seconds), Vec::new()), t0())
            .unwrap();
        let sink = ScriptedSink::new(SinkMode::Accept);
        let engine = SchedulerEngine::new(store.clone(), sink.clone(), config());

        let (_tx, rx) = watch::channel(true);
        let report = engine.tick(t0() + ChronoDuration::seconds(10), &rx).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(sink.calls(), 0);
        assert_eq!(store.get(&job.id).unwrap().version, job.version);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = store();
        let sink = ScriptedSink::new(SinkMode::Accept);
        let engine = SchedulerEngine::new(store, sink, config());
        let health = engine.health();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let snapshot = health.borrow().clone();
        assert_eq!(snapshot.state, EngineState::Stopped);
        assert!(snapshot.healthy);
        assert!(snapshot.ticks >= 1);
    }

    #[tokio::test]
    async fn run_halts_after_repeated_store_failures() {
        let store = store();
        store.with_conn(|conn| conn.execute_batch("DROP TABLE jobs;").unwrap());
        let sink = ScriptedSink::new(SinkMode::Accept);
        let engine = SchedulerEngine::new(store, sink, config());
        let health = engine.health();

        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), engine.run(rx))
            .await
            .unwrap();
        assert!(result.is_err());

        let snapshot = health.borrow().clone();
        assert_eq!(snapshot.state, EngineState::Failed);
        assert!(!snapshot.healthy);
        assert!(snapshot.last_error.is_some());
    }
}
