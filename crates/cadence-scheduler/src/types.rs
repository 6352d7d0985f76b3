use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when and how often a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Run repeatedly with a fixed period.
    Interval {
        every: Period,
        /// Remaining dispatches; `None` repeats forever.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat: Option<u32>,
        /// Grid anchor for the first occurrence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_at: Option<DateTime<Utc>>,
    },

    /// Run according to a cron expression evaluated in `timezone`.
    Cron {
        expression: String,
        /// IANA name; filled with the store's default when registered without one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        /// Remaining dispatches; `None` repeats forever.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat: Option<u32>,
    },
}

impl Schedule {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Once { .. } => ScheduleKind::Once,
            Schedule::Interval { .. } => ScheduleKind::Interval,
            Schedule::Cron { .. } => ScheduleKind::Cron,
        }
    }

    /// Remaining dispatch budget. `Once` always has one shot left until it fires.
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Schedule::Once { .. } => Some(1),
            Schedule::Interval { repeat, .. } | Schedule::Cron { repeat, .. } => *repeat,
        }
    }

    /// Shorthand for an unbounded cron schedule.
    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
            timezone: None,
            repeat: None,
        }
    }

    /// Shorthand for an unbounded interval schedule without an anchor.
    pub fn every(value: u64, unit: IntervalUnit) -> Self {
        Schedule::Interval {
            every: Period::new(value, unit),
            repeat: None,
            start_at: None,
        }
    }
}

/// Variant tag of [`Schedule`], stored in its own column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Once,
    Interval,
    Cron,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleKind::Once => "once",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Cron => "cron",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleKind::Once),
            "interval" => Ok(ScheduleKind::Interval),
            "cron" => Ok(ScheduleKind::Cron),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Unit of an interval period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl IntervalUnit {
    pub fn seconds(self) -> u64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
            IntervalUnit::Weeks => 604_800,
        }
    }
}

impl std::fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
            IntervalUnit::Weeks => "weeks",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "seconds" | "second" | "s" => Ok(IntervalUnit::Seconds),
            "minutes" | "minute" | "m" => Ok(IntervalUnit::Minutes),
            "hours" | "hour" | "h" => Ok(IntervalUnit::Hours),
            "days" | "day" | "d" => Ok(IntervalUnit::Days),
            "weeks" | "week" | "w" => Ok(IntervalUnit::Weeks),
            other => Err(format!("unknown interval unit: {other}")),
        }
    }
}

/// Interval period, e.g. `15 minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub value: u64,
    pub unit: IntervalUnit,
}

impl Period {
    pub fn new(value: u64, unit: IntervalUnit) -> Self {
        Self { value, unit }
    }

    pub fn as_secs(&self) -> u64 {
        self.value.saturating_mul(self.unit.seconds())
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Whether a job can still produce occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Has (or can regain) a future occurrence.
    Active,
    /// Schedule ran out: fired `Once`, repeat budget spent, or nothing left in the future.
    Exhausted,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Active => "active",
            JobStatus::Exhausted => "exhausted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "exhausted" => Ok(JobStatus::Exhausted),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 string; primary key, never changes.
    pub id: String,
    pub namespace: String,
    /// Unique within `namespace`.
    pub name: String,
    pub schedule: Schedule,
    /// Opaque task descriptor handed to the sink.
    pub payload: Vec<u8>,
    pub enabled: bool,
    pub status: JobStatus,
    /// `None` when exhausted or disabled.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Set when an occurrence is claimed for dispatch.
    pub last_enqueued_at: Option<DateTime<Utc>>,
    /// Total occurrences claimed.
    pub run_count: u32,
    /// Optimistic-concurrency token; bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn kind(&self) -> ScheduleKind {
        self.schedule.kind()
    }

    /// Enabled with an occurrence at or before `at`.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= at)
    }
}

/// Registration request for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub schedule: Schedule,
    pub payload: Vec<u8>,
    pub enabled: bool,
}

impl NewJob {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            schedule,
            payload: payload.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Fields a user edit may change; handed to the `update` mutator.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEdit {
    pub name: String,
    pub schedule: Schedule,
    pub payload: Vec<u8>,
    pub enabled: bool,
}

impl From<&Job> for JobEdit {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            schedule: job.schedule.clone(),
            payload: job.payload.clone(),
            enabled: job.enabled,
        }
    }
}

/// A won claim: the occurrence to dispatch and the job state after advancing.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Payload as it was before the advance.
    pub payload: Vec<u8>,
    /// The occurrence being dispatched (the pre-advance `next_run_at`).
    pub scheduled_for: DateTime<Utc>,
    /// Grid points that fell between `scheduled_for` and the claim time.
    pub skipped: u64,
    /// Job record as written by the claim.
    pub job: Job,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_serializes_with_kind_tag() {
        let schedule = Schedule::Interval {
            every: Period::new(15, IntervalUnit::Minutes),
            repeat: Some(3),
            start_at: None,
        };
        let json = serde_json::to_string(&schedule).unwrap();
        assert!(json.contains(r#""kind":"interval""#));
        assert!(json.contains(r#""unit":"minutes""#));
        assert!(!json.contains("start_at"));
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn cron_json_without_optionals_parses() {
        let schedule: Schedule =
            serde_json::from_str(r#"{"kind":"cron","expression":"0 0 * * *"}"#).unwrap();
        assert_eq!(schedule, Schedule::cron("0 0 * * *"));
        assert_eq!(schedule.kind(), ScheduleKind::Cron);
    }

    #[test]
    fn period_seconds_per_unit() {
        assert_eq!(Period::new(2, IntervalUnit::Weeks).as_secs(), 1_209_600);
        assert_eq!(Period::new(2, IntervalUnit::Days).as_secs(), 172_800);
        assert_eq!(Period::new(2, IntervalUnit::Hours).as_secs(), 7_200);
        assert_eq!(Period::new(15, IntervalUnit::Minutes).as_secs(), 900);
        assert_eq!(Period::new(15, IntervalUnit::Seconds).as_secs(), 15);
    }

    #[test]
    fn period_display() {
        assert_eq!(Period::new(15, IntervalUnit::Minutes).to_string(), "15 minutes");
    }

    #[test]
    fn kind_and_status_round_trip_through_strings() {
        for kind in [ScheduleKind::Once, ScheduleKind::Interval, ScheduleKind::Cron] {
            assert_eq!(kind.to_string().parse::<ScheduleKind>().unwrap(), kind);
        }
        for status in [JobStatus::Active, JobStatus::Exhausted] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn once_has_single_shot_budget() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Schedule::Once { at }.remaining(), Some(1));
        assert_eq!(Schedule::cron("* * * * *").remaining(), None);
    }
}
