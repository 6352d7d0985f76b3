use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::cron::CronExpr;
use crate::error::{Result, SchedulerError};
use crate::types::Schedule;

/// Upper bound on missed cron occurrences counted during one advance.
const MAX_COUNTED_SKIPS: u64 = 1_024;

/// Resolve an IANA timezone name; `None` means UTC.
pub fn resolve_timezone(name: Option<&str>) -> Result<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidScheduleSpec(format!("unknown timezone: {name}"))),
    }
}

/// Check that `schedule` is well formed and can produce occurrences.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Once { .. } => Ok(()),
        Schedule::Interval { every, .. } => {
            if every.as_secs() == 0 {
                return Err(SchedulerError::InvalidScheduleSpec(format!(
                    "interval period must be positive, got {every}"
                )));
            }
            Ok(())
        }
        Schedule::Cron {
            expression,
            timezone,
            ..
        } => {
            CronExpr::parse(expression)?;
            resolve_timezone(timezone.as_deref())?;
            Ok(())
        }
    }
}

/// Reject interval periods a scheduler polling every `poll` cannot honour:
/// shorter than the poll interval, or not a whole multiple of it.
pub fn check_granularity(schedule: &Schedule, poll: StdDuration) -> Result<()> {
    let Schedule::Interval { every, .. } = schedule else {
        return Ok(());
    };
    let poll_secs = poll.as_secs().max(1);
    let period = every.as_secs();
    if period < poll_secs {
        return Err(SchedulerError::InvalidScheduleSpec(format!(
            "interval {every} is more frequent than the {poll_secs}s poll interval"
        )));
    }
    if period % poll_secs != 0 {
        return Err(SchedulerError::InvalidScheduleSpec(format!(
            "interval {every} is not a multiple of the {poll_secs}s poll interval"
        )));
    }
    Ok(())
}

/// Compute the next occurrence of `schedule` strictly after `after`.
///
/// Pure: the remaining-repeat counter is read but never decremented here.
/// Returns `None` when the schedule has nothing left to fire (a `Once` whose
/// instant has passed, or a spent repeat budget).
pub fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match schedule {
        Schedule::Once { at } => Ok((*at > after).then_some(*at)),

        Schedule::Interval { every, repeat, .. } => {
            let secs = every.as_secs();
            if secs == 0 {
                return Err(SchedulerError::InvalidScheduleSpec(format!(
                    "interval period must be positive, got {every}"
                )));
            }
            if *repeat == Some(0) {
                return Ok(None);
            }
            Ok(Some(after + period(secs)?))
        }

        Schedule::Cron {
            expression,
            timezone,
            repeat,
        } => {
            let expr = CronExpr::parse(expression)?;
            let tz = resolve_timezone(timezone.as_deref())?;
            if *repeat == Some(0) {
                return Ok(None);
            }
            expr.next_after(after, tz).map(Some).ok_or_else(|| {
                SchedulerError::InvalidScheduleSpec(format!(
                    "cron {expression:?} has no future occurrence"
                ))
            })
        }
    }
}

/// Schedule state for a freshly registered or edited job.
///
/// Interval schedules start at `start_at` when it lies ahead. A past anchor
/// is rolled forward on its grid and every grid point at or before `now`
/// spends one repeat, so an old anchor can leave the job exhausted. Without
/// an anchor the first run is one period after `now`.
pub fn initial_next_run(schedule: &Schedule, now: DateTime<Utc>) -> Result<Advance> {
    match schedule {
        Schedule::Interval {
            every,
            repeat,
            start_at,
        } => {
            validate(schedule)?;
            let step = period(every.as_secs())?;
            let (next, elapsed) = match start_at {
                Some(anchor) if *anchor <= now => {
                    let (next, passed) = roll_forward(*anchor, step, now);
                    (next, passed + 1)
                }
                Some(anchor) => (*anchor, 0),
                None => (now + step, 0),
            };
            let spent = u32::try_from(elapsed).unwrap_or(u32::MAX);
            let remaining = repeat.map(|n| n.saturating_sub(spent));
            let exhausted = remaining == Some(0);
            Ok(Advance {
                schedule: Schedule::Interval {
                    every: *every,
                    repeat: remaining,
                    start_at: if exhausted { *start_at } else { start_at.map(|_| next) },
                },
                next_run_at: (!exhausted).then_some(next),
                skipped: elapsed,
            })
        }
        _ => Ok(Advance {
            schedule: schedule.clone(),
            next_run_at: next_occurrence(schedule, now)?,
            skipped: 0,
        }),
    }
}

/// Schedule state after registration or after a claimed occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    /// Schedule with its repeat budget reduced.
    pub schedule: Schedule,
    /// Next occurrence strictly after `now`, or `None` when exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Occurrences that fell at or before `now` without being dispatched.
    /// They are dropped, never replayed.
    pub skipped: u64,
}

/// Advance `schedule` after dispatching the occurrence at `scheduled_for`,
/// claimed at `now`.
pub fn advance(
    schedule: &Schedule,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Advance> {
    match schedule {
        Schedule::Once { .. } => Ok(Advance {
            schedule: schedule.clone(),
            next_run_at: None,
            skipped: 0,
        }),

        Schedule::Interval {
            every,
            repeat,
            start_at,
        } => {
            let remaining = repeat.map(|n| n.saturating_sub(1));
            if remaining == Some(0) {
                return Ok(Advance {
                    schedule: Schedule::Interval {
                        every: *every,
                        repeat: remaining,
                        start_at: *start_at,
                    },
                    next_run_at: None,
                    skipped: 0,
                });
            }
            let step = period(every.as_secs())?;
            let anchor = scheduled_for.min(now);
            let (next, skipped) = roll_forward(anchor, step, now);
            // A pinned anchor follows the pending occurrence so a later
            // re-enable only spends points that elapsed after it.
            Ok(Advance {
                schedule: Schedule::Interval {
                    every: *every,
                    repeat: remaining,
                    start_at: start_at.map(|_| next),
                },
                next_run_at: Some(next),
                skipped,
            })
        }

        Schedule::Cron {
            expression,
            timezone,
            repeat,
        } => {
            let remaining = repeat.map(|n| n.saturating_sub(1));
            let updated = Schedule::Cron {
                expression: expression.clone(),
                timezone: timezone.clone(),
                repeat: remaining,
            };
            let next_run_at = next_occurrence(&updated, now)?;
            let skipped = if next_run_at.is_some() {
                count_cron_skips(&updated, scheduled_for, now)?
            } else {
                0
            };
            Ok(Advance {
                schedule: updated,
                next_run_at,
                skipped,
            })
        }
    }
}

/// First grid point `anchor + k * step` strictly after `now` (k >= 1), and
/// how many grid points were passed over on the way.
fn roll_forward(
    anchor: DateTime<Utc>,
    step: Duration,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, u64) {
    let step_ms = step.num_milliseconds().max(1);
    let elapsed_ms = (now - anchor).num_milliseconds().max(0);
    let k = elapsed_ms / step_ms + 1;
    let next = anchor + Duration::milliseconds(k.saturating_mul(step_ms));
    (next, (k - 1) as u64)
}

fn count_cron_skips(
    schedule: &Schedule,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut skipped = 0;
    let mut cursor = scheduled_for;
    while skipped < MAX_COUNTED_SKIPS {
        match next_occurrence(schedule, cursor)? {
            Some(t) if t <= now => {
                skipped += 1;
                cursor = t;
            }
            _ => break,
        }
    }
    Ok(skipped)
}

fn period(secs: u64) -> Result<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| SchedulerError::InvalidScheduleSpec(format!("interval of {secs}s is too long")))
}
