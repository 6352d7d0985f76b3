use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    db,
    error::{Result, SchedulerError},
    schedule::{self, Advance},
    types::{Claim, Job, JobEdit, JobStatus, NewJob, Schedule, ScheduleKind},
};

const JOB_COLUMNS: &str = "id, namespace, name, schedule_kind, schedule, payload, enabled, status,
     next_run_at, last_enqueued_at, run_count, version, created_at, updated_at";

/// Per-handle settings of a [`JobStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Namespace every query of this handle is scoped to.
    pub namespace: String,
    /// Timezone given to cron schedules registered without one.
    pub default_timezone: Option<String>,
    /// When set, interval periods must be whole multiples of this poll interval.
    pub granularity: Option<Duration>,
}

impl StoreOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            default_timezone: None,
            granularity: None,
        }
    }

    pub fn with_default_timezone(mut self, tz: impl Into<String>) -> Self {
        self.default_timezone = Some(tz.into());
        self
    }

    pub fn with_granularity(mut self, poll: Duration) -> Self {
        self.granularity = Some(poll);
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new(cadence_core::config::DEFAULT_NAMESPACE)
    }
}

impl From<&SchedulerConfig> for StoreOptions {
    fn from(cfg: &SchedulerConfig) -> Self {
        let opts = Self::new(cfg.namespace.clone()).with_default_timezone(cfg.default_timezone.clone());
        if cfg.enforce_poll_granularity {
            opts.with_granularity(cfg.poll_interval())
        } else {
            opts
        }
    }
}

/// Durable repository of job definitions for one namespace.
///
/// Thread-safe: wraps the SQLite connection in a Mutex. Several `JobStore`
/// handles (in one process or many) may share a database file; the claim
/// race between them is settled by SQLite write locks plus the row version.
pub struct JobStore {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl JobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, options: StoreOptions) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration, options: StoreOptions) -> Result<Self> {
        Self::new(db::open(path, busy_timeout)?, options)
    }

    pub fn namespace(&self) -> &str {
        &self.options.namespace
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new job. Fails with `DuplicateName` when the name is taken.
    pub fn create(&self, new: NewJob) -> Result<Job> {
        self.create_at(new, Utc::now())
    }

    /// [`create`](Self::create) with an explicit registration time.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub fn create_at(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let now = now.trunc_subsecs(3);
        let schedule = self.prepare_schedule(new.schedule)?;
        let (schedule, next_run_at) = if new.enabled {
            let first = schedule::initial_next_run(&schedule, now)?;
            (first.schedule, first.next_run_at)
        } else {
            (schedule, None)
        };
        let job = Job {
            id: cadence_core::types::new_job_id(),
            namespace: self.options.namespace.clone(),
            name: new.name,
            status: status_for(new.enabled, next_run_at),
            schedule,
            payload: new.payload,
            enabled: new.enabled,
            next_run_at,
            last_enqueued_at: None,
            run_count: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock();
        insert(&conn, &job)?;
        info!(job_id = %job.id, kind = %job.kind(), next_run_at = ?job.next_run_at, "job created");
        Ok(job)
    }

    /// Fetch a job by id.
    pub fn get(&self, id: &str) -> Result<Job> {
        let conn = self.lock();
        read_job(&conn, &self.options.namespace, id)
    }

    /// Look a job up by its unique name.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Job>> {
        let conn = self.lock();
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE namespace = ?1 AND name = ?2");
        let row = conn
            .query_row(&sql, params![self.options.namespace, name], JobRow::from_row)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// Idempotent registration: return the job named `new.name`, creating it
    /// from `new` when absent. An existing job is returned unchanged.
    pub fn ensure(&self, new: NewJob) -> Result<Job> {
        if let Some(job) = self.find_by_name(&new.name)? {
            debug!(job_id = %job.id, name = %job.name, "job already registered");
            return Ok(job);
        }
        let name = new.name.clone();
        match self.create(new) {
            // Lost a registration race to another handle.
            Err(SchedulerError::DuplicateName { .. }) => self
                .find_by_name(&name)?
                .ok_or(SchedulerError::NotFound { id: name }),
            other => other,
        }
    }

    /// Apply a user edit under optimistic concurrency.
    ///
    /// The mutator sees the current editable fields. The result is
    /// re-validated; `next_run_at` is recomputed from now when the schedule
    /// or the enabled flag changed.
    #[instrument(skip(self, mutator))]
    pub fn update<F>(&self, id: &str, mutator: F, expected_version: i64) -> Result<Job>
    where
        F: FnOnce(&mut JobEdit),
    {
        let now = Utc::now().trunc_subsecs(3);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = read_job(&tx, &self.options.namespace, id)?;
        if current.version != expected_version {
            return Err(SchedulerError::ConcurrentModification {
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        let before = JobEdit::from(&current);
        let mut edit = before.clone();
        mutator(&mut edit);
        if edit == before {
            return Ok(current);
        }

        let schedule = self.prepare_schedule(edit.schedule)?;
        let (schedule, next_run_at) =
            if schedule != current.schedule || edit.enabled != current.enabled {
                if edit.enabled {
                    let first = schedule::initial_next_run(&schedule, now)?;
                    (first.schedule, first.next_run_at)
                } else {
                    (schedule, None)
                }
            } else {
                (schedule, current.next_run_at)
            };

        let updated = Job {
            name: edit.name,
            status: status_for(edit.enabled, next_run_at),
            schedule,
            payload: edit.payload,
            enabled: edit.enabled,
            next_run_at,
            version: current.version + 1,
            updated_at: now,
            ..current
        };

        let n = tx
            .execute(
                "UPDATE jobs SET name = ?1, schedule_kind = ?2, schedule = ?3, payload = ?4,
                    enabled = ?5, status = ?6, next_run_at = ?7, version = version + 1,
                    updated_at = ?8
                 WHERE id = ?9 AND version = ?10",
                params![
                    updated.name,
                    updated.kind().to_string(),
                    serde_json::to_string(&updated.schedule)?,
                    updated.payload,
                    updated.enabled,
                    updated.status.to_string(),
                    updated.next_run_at.map(to_millis),
                    to_rfc3339(updated.updated_at),
                    id,
                    expected_version,
                ],
            )
            .map_err(|e| unique_violation(e, &self.options.namespace, &updated.name))?;
        if n != 1 {
            return Err(SchedulerError::ConcurrentModification {
                id: id.to_string(),
                expected: expected_version,
                found: expected_version + 1,
            });
        }
        tx.commit()?;

        info!(job_id = %id, version = updated.version, next_run_at = ?updated.next_run_at, "job updated");
        Ok(updated)
    }

    /// Enable or disable a job. Disabling clears `next_run_at`; enabling
    /// recomputes it from now.
    pub fn set_enabled(&self, id: &str, enabled: bool, expected_version: i64) -> Result<Job> {
        self.update(id, |edit| edit.enabled = enabled, expected_version)
    }

    /// Remove a job. Succeeds when the job is already gone; returns whether
    /// a row was deleted.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND namespace = ?2",
            params![id, self.options.namespace],
        )?;
        if n > 0 {
            info!(job_id = %id, "job deleted");
        } else {
            debug!(job_id = %id, "delete of absent job");
        }
        Ok(n > 0)
    }

    /// Enabled jobs with `next_run_at <= at`, ordered by `next_run_at` then `id`.
    pub fn due_before(&self, at: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE namespace = ?1 AND enabled = 1
               AND next_run_at IS NOT NULL AND next_run_at <= ?2
             ORDER BY next_run_at ASC, id ASC"
        );
        query_jobs(&conn, &sql, params![self.options.namespace, to_millis(at)])
    }

    /// All jobs of the namespace, oldest first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE namespace = ?1 ORDER BY created_at ASC, id ASC"
        );
        query_jobs(&conn, &sql, params![self.options.namespace])
    }

    /// Atomically claim the due occurrence of job `id` and advance the job
    /// past `now`.
    ///
    /// Runs in an IMMEDIATE transaction: the job is re-read, must still be
    /// enabled and due, and the write is conditioned on the version read.
    /// Exactly one of any number of concurrent callers wins; the others get
    /// `AlreadyClaimed`.
    #[instrument(skip(self))]
    pub fn claim_and_advance(&self, id: &str, now: DateTime<Utc>) -> Result<Claim> {
        let now = now.trunc_subsecs(3);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = read_job(&tx, &self.options.namespace, id)?;
        let scheduled_for = match job.next_run_at {
            Some(next) if job.is_due(now) => next,
            _ => return Err(SchedulerError::AlreadyClaimed { id: id.to_string() }),
        };

        let step = match schedule::advance(&job.schedule, scheduled_for, now) {
            Ok(step) => step,
            Err(SchedulerError::InvalidScheduleSpec(reason)) => {
                warn!(job_id = %id, %reason, "schedule cannot advance; exhausting job");
                Advance {
                    schedule: job.schedule.clone(),
                    next_run_at: None,
                    skipped: 0,
                }
            }
            Err(e) => return Err(e),
        };

        let advanced = Job {
            status: status_for(job.enabled, step.next_run_at),
            schedule: step.schedule,
            next_run_at: step.next_run_at.map(|t| t.trunc_subsecs(3)),
            last_enqueued_at: Some(now),
            run_count: job.run_count.saturating_add(1),
            version: job.version + 1,
            updated_at: now,
            ..job.clone()
        };

        let n = tx.execute(
            "UPDATE jobs SET schedule = ?1, status = ?2, next_run_at = ?3,
                last_enqueued_at = ?4, run_count = ?5, version = version + 1, updated_at = ?6
             WHERE id = ?7 AND version = ?8",
            params![
                serde_json::to_string(&advanced.schedule)?,
                advanced.status.to_string(),
                advanced.next_run_at.map(to_millis),
                to_millis(now),
                advanced.run_count,
                to_rfc3339(now),
                id,
                job.version,
            ],
        )?;
        if n != 1 {
            return Err(SchedulerError::AlreadyClaimed { id: id.to_string() });
        }
        tx.commit()?;

        debug!(
            job_id = %id,
            scheduled_for = %scheduled_for,
            next_run_at = ?advanced.next_run_at,
            skipped = step.skipped,
            "occurrence claimed"
        );
        Ok(Claim {
            payload: job.payload,
            scheduled_for,
            skipped: step.skipped,
            job: advanced,
        })
    }

    /// Make an enabled, non-exhausted job due at `now` without touching its
    /// schedule. Interval grids restart from the forced occurrence.
    #[instrument(skip(self))]
    pub fn run_now(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let now = now.trunc_subsecs(3);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = read_job(&tx, &self.options.namespace, id)?;
        if !job.enabled || job.status == JobStatus::Exhausted {
            warn!(job_id = %id, enabled = job.enabled, status = %job.status, "run-now ignored");
            return Ok(job);
        }

        tx.execute(
            "UPDATE jobs SET next_run_at = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4",
            params![to_millis(now), to_rfc3339(now), id, job.version],
        )?;
        tx.commit()?;

        info!(job_id = %id, "job forced due");
        Ok(Job {
            next_run_at: Some(now),
            version: job.version + 1,
            updated_at: now,
            ..job
        })
    }

    /// Startup reconciliation: give every enabled, active job that lacks a
    /// `next_run_at` a fresh one computed from `now`. Returns how many rows
    /// were touched.
    #[instrument(skip(self))]
    pub fn reschedule_enabled(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = now.trunc_subsecs(3);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE namespace = ?1 AND enabled = 1 AND status = 'active' AND next_run_at IS NULL"
        );
        let stale = query_jobs(&tx, &sql, params![self.options.namespace])?;

        let mut touched = 0;
        for job in stale {
            let first = match schedule::initial_next_run(&job.schedule, now) {
                Ok(first) => first,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "cannot reschedule job");
                    continue;
                }
            };
            tx.execute(
                "UPDATE jobs SET schedule = ?1, next_run_at = ?2, status = ?3,
                    version = version + 1, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    serde_json::to_string(&first.schedule)?,
                    first.next_run_at.map(to_millis),
                    status_for(true, first.next_run_at).to_string(),
                    to_rfc3339(now),
                    job.id,
                    job.version,
                ],
            )?;
            touched += 1;
        }
        tx.commit()?;

        if touched > 0 {
            info!(count = touched, "jobs rescheduled");
        }
        Ok(touched)
    }

    /// Normalise and validate a schedule before it is written.
    fn prepare_schedule(&self, schedule: Schedule) -> Result<Schedule> {
        let schedule = match schedule {
            Schedule::Once { at } => Schedule::Once {
                at: at.trunc_subsecs(3),
            },
            Schedule::Interval {
                every,
                repeat,
                start_at,
            } => Schedule::Interval {
                every,
                repeat,
                start_at: start_at.map(|t| t.trunc_subsecs(3)),
            },
            Schedule::Cron {
                expression,
                timezone,
                repeat,
            } => Schedule::Cron {
                expression,
                timezone: timezone.or_else(|| self.options.default_timezone.clone()),
                repeat,
            },
        };
        schedule::validate(&schedule)?;
        if let Some(poll) = self.options.granularity {
            schedule::check_granularity(&schedule, poll)?;
        }
        Ok(schedule)
    }

    #[cfg(test)]
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.lock())
    }
}

// --- row mapping -----------------------------------------------------------

/// Raw column values of one `jobs` row.
struct JobRow {
    id: String,
    namespace: String,
    name: String,
    schedule_kind: String,
    schedule: String,
    payload: Vec<u8>,
    enabled: bool,
    status: String,
    next_run_at: Option<i64>,
    last_enqueued_at: Option<i64>,
    run_count: u32,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            namespace: row.get(1)?,
            name: row.get(2)?,
            schedule_kind: row.get(3)?,
            schedule: row.get(4)?,
            payload: row.get(5)?,
            enabled: row.get(6)?,
            status: row.get(7)?,
            next_run_at: row.get(8)?,
            last_enqueued_at: row.get(9)?,
            run_count: row.get(10)?,
            version: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let id = self.id;
        let corrupt = |reason: String| SchedulerError::Corrupt {
            id: id.clone(),
            reason,
        };

        let kind: ScheduleKind = self.schedule_kind.parse().map_err(&corrupt)?;
        let schedule: Schedule = serde_json::from_str(&self.schedule)
            .map_err(|e| corrupt(format!("schedule: {e}")))?;
        if schedule.kind() != kind {
            return Err(corrupt(format!(
                "schedule_kind {kind} does not match {} schedule",
                schedule.kind()
            )));
        }
        let status: JobStatus = self.status.parse().map_err(&corrupt)?;
        let next_run_at = self.next_run_at.map(|ms| from_millis(ms, &corrupt)).transpose()?;
        if status == JobStatus::Exhausted && next_run_at.is_some() {
            return Err(corrupt("exhausted job has a next_run_at".into()));
        }
        let last_enqueued_at = self
            .last_enqueued_at
            .map(|ms| from_millis(ms, &corrupt))
            .transpose()?;
        let created_at = from_rfc3339(&self.created_at, &corrupt)?;
        let updated_at = from_rfc3339(&self.updated_at, &corrupt)?;

        Ok(Job {
            id,
            namespace: self.namespace,
            name: self.name,
            schedule,
            payload: self.payload,
            enabled: self.enabled,
            status,
            next_run_at,
            last_enqueued_at,
            run_count: self.run_count,
            version: self.version,
            created_at,
            updated_at,
        })
    }
}

fn read_job(conn: &Connection, namespace: &str, id: &str) -> Result<Job> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND namespace = ?2");
    conn.query_row(&sql, params![id, namespace], JobRow::from_row)
        .optional()?
        .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?
        .into_job()
}

/// Run a job query. Corrupt rows are logged and skipped so one bad record
/// cannot stall scans of the rest.
fn query_jobs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        match row.into_job() {
            Ok(job) => jobs.push(job),
            Err(e) => error!(code = e.code(), "skipping unreadable job: {e}"),
        }
    }
    Ok(jobs)
}

fn insert(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs
         (id, namespace, name, schedule_kind, schedule, payload, enabled, status,
          next_run_at, last_enqueued_at, run_count, version, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,0,?10,?11,?11)",
        params![
            job.id,
            job.namespace,
            job.name,
            job.kind().to_string(),
            serde_json::to_string(&job.schedule)?,
            job.payload,
            job.enabled,
            job.status.to_string(),
            job.next_run_at.map(to_millis),
            job.version,
            to_rfc3339(job.created_at),
        ],
    )
    .map_err(|e| unique_violation(e, &job.namespace, &job.name))?;
    Ok(())
}

fn unique_violation(err: rusqlite::Error, namespace: &str, name: &str) -> SchedulerError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            SchedulerError::DuplicateName {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        other => other.into(),
    }
}

fn status_for(enabled: bool, next_run_at: Option<DateTime<Utc>>) -> JobStatus {
    if enabled && next_run_at.is_none() {
        JobStatus::Exhausted
    } else {
        JobStatus::Active
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(
    ms: i64,
    corrupt: &impl Fn(String) -> SchedulerError,
) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt(format!("timestamp {ms} out of range")))
}

fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_rfc3339(s: &str, corrupt: &impl Fn(String) -> SchedulerError) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalUnit;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn store() -> JobStore {
        JobStore::new(Connection::open_in_memory().unwrap(), StoreOptions::default()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn every(secs: u64, repeat: Option<u32>) -> Schedule {
        Schedule::Interval {
            every: crate::types::Period::new(secs, IntervalUnit::Seconds),
            repeat,
            start_at: None,
        }
    }

    #[test]
    fn create_then_get() {
        let store = store();
        let job = store
            .create_at(NewJob::new("report", every(10, None), b"task".to_vec()), t0())
            .unwrap();
        assert_eq!(job.version, 1);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.next_run_at, Some(t0() + ChronoDuration::seconds(10)));

        let loaded = store.get(&job.id).unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let store = store();
        store.create(NewJob::new("report", every(10, None), Vec::new())).unwrap();
        let err = store
            .create(NewJob::new("report", Schedule::cron("0 0 * * *"), Vec::new()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));
    }

    #[test]
    fn get_missing_is_not_found() {
        assert!(matches!(store().get("nope"), Err(SchedulerError::NotFound { .. })));
    }

    #[test]
    fn invalid_schedule_never_reaches_the_table() {
        let store = store();
        let err = store
            .create(NewJob::new("bad", Schedule::cron("61 * * * *"), Vec::new()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidScheduleSpec(_)));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn cron_without_timezone_takes_store_default() {
        let store = JobStore::new(
            Connection::open_in_memory().unwrap(),
            StoreOptions::default().with_default_timezone("Europe/Berlin"),
        )
        .unwrap();
        let job = store
            .create(NewJob::new("nightly", Schedule::cron("0 3 * * *"), Vec::new()))
            .unwrap();
        assert!(matches!(
            job.schedule,
            Schedule::Cron { timezone: Some(ref tz), .. } if tz == "Europe/Berlin"
        ));
    }

    #[test]
    fn granularity_is_enforced_when_configured() {
        let store = JobStore::new(
            Connection::open_in_memory().unwrap(),
            StoreOptions::default().with_granularity(Duration::from_secs(60)),
        )
        .unwrap();
        assert!(store.create(NewJob::new("fast", every(30, None), Vec::new())).is_err());
        assert!(store.create(NewJob::new("slow", every(120, None), Vec::new())).is_ok());
    }

    #[test]
    fn update_checks_version() {
        let store = store();
        let job = store.create(NewJob::new("a", every(10, None), b"v1".to_vec())).unwrap();

        let updated = store
            .update(&job.id, |e| e.payload = b"v2".to_vec(), job.version)
            .unwrap();
        assert_eq!(updated.version, job.version + 1);
        assert_eq!(updated.payload, b"v2");
        // Payload-only edits keep the occurrence.
        assert_eq!(updated.next_run_at, job.next_run_at);

        let err = store
            .update(&job.id, |e| e.payload = b"v3".to_vec(), job.version)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::ConcurrentModification { expected: 1, found: 2, .. }
        ));
        assert_eq!(store.get(&job.id).unwrap().payload, b"v2");
    }

    #[test]
    fn update_rejects_invalid_schedule() {
        let store = store();
        let job = store.create(NewJob::new("a", every(10, None), Vec::new())).unwrap();
        let err = store
            .update(&job.id, |e| e.schedule = Schedule::cron("bogus"), job.version)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidScheduleSpec(_)));
        assert_eq!(store.get(&job.id).unwrap().version, job.version);
    }

    #[test]
    fn rename_onto_existing_name_is_duplicate() {
        let store = store();
        store.create(NewJob::new("a", every(10, None), Vec::new())).unwrap();
        let b = store.create(NewJob::new("b", every(10, None), Vec::new())).unwrap();
        let err = store.update(&b.id, |e| e.name = "a".into(), b.version).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let store = store();
        let job = store.create(NewJob::new("a", every(10, None), Vec::new())).unwrap();
        assert!(store.delete(&job.id).unwrap());
        assert!(!store.delete(&job.id).unwrap());
        assert!(matches!(store.get(&job.id), Err(SchedulerError::NotFound { .. })));
    }

    #[test]
    fn due_before_orders_and_filters() {
        let store = store();
        let late = store.create_at(NewJob::new("late", every(30, None), Vec::new()), t0()).unwrap();
        let early = store.create_at(NewJob::new("early", every(10, None), Vec::new()), t0()).unwrap();
        let off = store
            .create_at(NewJob::new("off", every(10, None), Vec::new()).disabled(), t0())
            .unwrap();
        assert_eq!(off.next_run_at, None);

        let due = store.due_before(t0() + ChronoDuration::seconds(30)).unwrap();
        let ids: Vec<_> = due.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), late.id.as_str()]);

        assert!(store.due_before(t0() + ChronoDuration::seconds(9)).unwrap().is_empty());
    }

    #[test]
    fn disabled_job_is_never_due() {
        let store = store();
        let job = store.create_at(NewJob::new("a", every(10, None), Vec::new()), t0()).unwrap();
        let job = store.set_enabled(&job.id, false, job.version).unwrap();
        assert!(!job.enabled);
        assert_eq!(job.next_run_at, None);
        assert_eq!(job.status, JobStatus::Active);

        // Even a stale next_run_at written behind the store's back is ignored.
        store.with_conn(|conn| {
            conn.execute("UPDATE jobs SET next_run_at = 0 WHERE id = ?1", [&job.id])
                .unwrap();
        });
        assert!(store.due_before(t0() + ChronoDuration::days(365)).unwrap().is_empty());
    }

    #[test]
    fn enabling_recomputes_next_run() {
        let store = store();
        let job = store
            .create(NewJob::new("a", every(60, None), Vec::new()).disabled())
            .unwrap();
        let before = Utc::now();
        let job = store.set_enabled(&job.id, true, job.version).unwrap();
        let next = job.next_run_at.unwrap();
        assert!(next > before);
        assert!(next <= Utc::now() + ChronoDuration::seconds(61));
    }

    #[test]
    fn claim_advances_and_second_claim_loses() {
        let store = store();
        let job = store
            .create_at(NewJob::new("a", every(10, None), b"payload".to_vec()), t0())
            .unwrap();
        let now = t0() + ChronoDuration::seconds(10);

        let claim = store.claim_and_advance(&job.id, now).unwrap();
        assert_eq!(claim.payload, b"payload");
        assert_eq!(claim.scheduled_for, now);
        assert_eq!(claim.job.next_run_at, Some(now + ChronoDuration::seconds(10)));
        assert_eq!(claim.job.last_enqueued_at, Some(now));
        assert_eq!(claim.job.run_count, 1);
        assert_eq!(store.get(&job.id).unwrap(), claim.job);

        let err = store.claim_and_advance(&job.id, now).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyClaimed { .. }));
    }

    #[test]
    fn claim_of_job_not_yet_due_is_refused() {
        let store = store();
        let job = store.create_at(NewJob::new("a", every(10, None), Vec::new()), t0()).unwrap();
        let err = store.claim_and_advance(&job.id, t0()).unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyClaimed { .. }));
    }

    #[test]
    fn once_job_exhausts_after_claim() {
        let store = store();
        let at = t0() + ChronoDuration::minutes(5);
        let job = store
            .create_at(NewJob::new("once", Schedule::Once { at }, Vec::new()), t0())
            .unwrap();
        assert_eq!(job.next_run_at, Some(at));

        let claim = store.claim_and_advance(&job.id, at).unwrap();
        assert_eq!(claim.job.next_run_at, None);
        assert_eq!(claim.job.status, JobStatus::Exhausted);
        assert!(store.due_before(at + ChronoDuration::days(1)).unwrap().is_empty());
    }

    #[test]
    fn once_in_the_past_is_exhausted_at_creation() {
        let store = store();
        let job = store
            .create_at(
                NewJob::new("past", Schedule::Once { at: t0() - ChronoDuration::hours(1) }, Vec::new()),
                t0(),
            )
            .unwrap();
        assert_eq!(job.next_run_at, None);
        assert_eq!(job.status, JobStatus::Exhausted);
    }

    #[test]
    fn old_anchor_spends_repeats_at_creation() {
        let store = store();
        let hourly = |repeat: u32, back: ChronoDuration| Schedule::Interval {
            every: crate::types::Period::new(1, IntervalUnit::Hours),
            repeat: Some(repeat),
            start_at: Some(t0() - back),
        };

        let recent = store
            .create_at(NewJob::new("recent", hourly(5, ChronoDuration::minutes(30)), Vec::new()), t0())
            .unwrap();
        assert_eq!(recent.schedule.remaining(), Some(4));
        assert_eq!(recent.next_run_at, Some(t0() + ChronoDuration::minutes(30)));
        assert_eq!(store.get(&recent.id).unwrap().schedule.remaining(), Some(4));

        let stale = store
            .create_at(NewJob::new("stale", hourly(10, ChronoDuration::hours(10)), Vec::new()), t0())
            .unwrap();
        assert_eq!(stale.next_run_at, None);
        assert_eq!(stale.status, JobStatus::Exhausted);
    }

    #[test]
    fn late_claim_skips_missed_occurrences() {
        let store = store();
        let job = store.create_at(NewJob::new("a", every(10, None), Vec::new()), t0()).unwrap();
        let claim = store
            .claim_and_advance(&job.id, t0() + ChronoDuration::seconds(45))
            .unwrap();
        assert_eq!(claim.scheduled_for, t0() + ChronoDuration::seconds(10));
        assert_eq!(claim.skipped, 3);
        assert_eq!(claim.job.next_run_at, Some(t0() + ChronoDuration::seconds(50)));
    }

    #[test]
    fn ensure_returns_existing_job() {
        let store = store();
        let first = store.ensure(NewJob::new("boot", every(60, None), b"a".to_vec())).unwrap();
        let second = store.ensure(NewJob::new("boot", every(120, None), b"b".to_vec())).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.payload, b"a");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn run_now_makes_job_due() {
        let store = store();
        let job = store.create_at(NewJob::new("a", every(3600, None), Vec::new()), t0()).unwrap();
        let now = t0() + ChronoDuration::seconds(5);
        let forced = store.run_now(&job.id, now).unwrap();
        assert_eq!(forced.next_run_at, Some(now));
        assert_eq!(forced.schedule, job.schedule);
        assert_eq!(store.due_before(now).unwrap().len(), 1);
    }

    #[test]
    fn run_now_ignores_disabled_jobs() {
        let store = store();
        let job = store
            .create(NewJob::new("a", every(60, None), Vec::new()).disabled())
            .unwrap();
        let same = store.run_now(&job.id, Utc::now()).unwrap();
        assert_eq!(same.next_run_at, None);
        assert_eq!(same.version, job.version);
    }

    #[test]
    fn reschedule_fills_missing_next_run() {
        let store = store();
        let job = store.create_at(NewJob::new("a", every(10, None), Vec::new()), t0()).unwrap();
        store.with_conn(|conn| {
            conn.execute("UPDATE jobs SET next_run_at = NULL WHERE id = ?1", [&job.id])
                .unwrap();
        });

        let now = t0() + ChronoDuration::hours(1);
        assert_eq!(store.reschedule_enabled(now).unwrap(), 1);
        let job = store.get(&job.id).unwrap();
        assert_eq!(job.next_run_at, Some(now + ChronoDuration::seconds(10)));
        assert_eq!(store.reschedule_enabled(now).unwrap(), 0);
    }

    #[test]
    fn kind_mismatch_is_corrupt() {
        let store = store();
        let job = store.create(NewJob::new("a", every(10, None), Vec::new())).unwrap();
        store.with_conn(|conn| {
            conn.execute("UPDATE jobs SET schedule_kind = 'cron' WHERE id = ?1", [&job.id])
                .unwrap();
        });
        assert!(matches!(store.get(&job.id), Err(SchedulerError::Corrupt { .. })));
        // Scans skip the bad row instead of failing.
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn subsecond_instants_survive_round_trip() {
        let store = store();
        let now = t0() + ChronoDuration::nanoseconds(123_456_789);
        let job = store.create_at(NewJob::new("a", every(10, None), Vec::new()), now).unwrap();
        assert_eq!(store.get(&job.id).unwrap(), job);
    }
}
