//! Cron expression parsing and evaluation.
//!
//! Supports the classic five-field layout (`min hour dom month dow`) and a
//! six-field layout with a leading seconds field. Evaluation happens on local
//! wall-clock time in an IANA timezone and is mapped back to UTC:
//!
//! * an ambiguous local time (autumn fall-back) fires once, at the later of
//!   its two UTC instants;
//! * a local time that does not exist (spring-forward gap) fires at the first
//!   valid instant after the gap.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// Years searched ahead before an expression is declared unsatisfiable.
/// Eight years always contains a Feb 29, even across a skipped century leap day.
const SEARCH_YEARS: i32 = 8;

/// Widest UTC offset change of any real-world DST transition, rounded up.
const MAX_DST_SHIFT_HOURS: i64 = 3;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Bitset of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    /// Smallest allowed value `>= value`.
    fn next_from(self, value: u32) -> Option<u32> {
        if value >= 64 {
            return None;
        }
        let masked = self.0 & (u64::MAX << value);
        (masked != 0).then(|| masked.trailing_zeros())
    }

    fn min(self) -> Option<u32> {
        self.next_from(0)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::str::FromStr for CronExpr {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        CronExpr::parse(s)
    }
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ if trimmed.starts_with('@') => {
                return Err(invalid(expression, format!("unknown macro {trimmed}")));
            }
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(invalid(
                    expression,
                    format!("expected 5 or 6 fields, found {n}"),
                ))
            }
        };

        let (seconds, _) = parse_field(expression, sec, 0, 59, None)?;
        let (minutes, _) = parse_field(expression, rest[0], 0, 59, None)?;
        let (hours, _) = parse_field(expression, rest[1], 0, 23, None)?;
        let (days_of_month, dom_restricted) = parse_field(expression, rest[2], 1, 31, None)?;
        let (months, _) = parse_field(expression, rest[3], 1, 12, Some((&MONTH_NAMES, 1)))?;
        let (raw_dow, dow_restricted) =
            parse_field(expression, rest[4], 0, 7, Some((&DAY_NAMES, 0)))?;
        // 7 is an alias for Sunday.
        let days_of_week = if raw_dow.contains(7) {
            FieldSet((raw_dow.0 | 1) & !(1 << 7))
        } else {
            raw_dow
        };

        let expr = CronExpr {
            source: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        };
        expr.check_satisfiable()?;
        Ok(expr)
    }

    /// Reject day-of-month/month combinations no calendar contains, e.g. Feb 30.
    fn check_satisfiable(&self) -> Result<()> {
        if !self.dom_restricted || self.dow_restricted {
            return Ok(());
        }
        let Some(first_day) = self.days_of_month.min() else {
            return Err(invalid(&self.source, "empty day-of-month".to_string()));
        };
        let possible = (1..=12u32)
            .filter(|m| self.months.contains(*m))
            .any(|m| first_day <= max_days_in_month(m));
        if possible {
            Ok(())
        } else {
            Err(invalid(
                &self.source,
                "day-of-month never occurs in the selected months".to_string(),
            ))
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Smallest naive local time `>= from` matching every field.
    fn next_naive(&self, from: NaiveDateTime, last_year: i32) -> Option<NaiveDateTime> {
        let mut t = from.with_nanosecond(0)?;
        loop {
            if t.year() > last_year {
                return None;
            }
            let date = t.date();

            if !self.months.contains(t.month()) {
                t = match self.months.next_from(t.month() + 1) {
                    Some(m) if m <= 12 => NaiveDate::from_ymd_opt(t.year(), m, 1)?,
                    _ => NaiveDate::from_ymd_opt(t.year() + 1, 1, 1)?,
                }
                .and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(date) {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = match self.hours.next_from(t.hour() + 1) {
                    Some(h) if h <= 23 => date.and_hms_opt(h, 0, 0)?,
                    _ => date.succ_opt()?.and_hms_opt(0, 0, 0)?,
                };
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t = match self.minutes.next_from(t.minute() + 1) {
                    Some(m) if m <= 59 => date.and_hms_opt(t.hour(), m, 0)?,
                    _ => date.and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1),
                };
                continue;
            }

            if !self.seconds.contains(t.second()) {
                t = match self.seconds.next_from(t.second() + 1) {
                    Some(s) if s <= 59 => date.and_hms_opt(t.hour(), t.minute(), s)?,
                    _ => date.and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1),
                };
                continue;
            }

            return Some(t);
        }
    }

    /// Smallest occurrence strictly after `after`, evaluated in `tz`.
    ///
    /// Returns `None` only when nothing matches within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        // Near a transition, local times earlier than `local` can still map to
        // instants after `after`; start the scan early and filter on UTC.
        let shift = Duration::hours(MAX_DST_SHIFT_HOURS);
        let offset_here = tz.offset_from_utc_datetime(&after.naive_utc()).fix();
        let transition_near = [after - shift, after + shift]
            .iter()
            .any(|t| tz.offset_from_utc_datetime(&t.naive_utc()).fix() != offset_here);
        let mut from = if transition_near {
            local - shift
        } else {
            local.with_nanosecond(0)? + Duration::seconds(1)
        };
        let last_year = local.year() + SEARCH_YEARS;

        loop {
            let candidate = self.next_naive(from, last_year)?;
            let resolved = match tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(_, later) => Some(later),
                LocalResult::None => gap_end(tz, candidate),
            };
            if let Some(dt) = resolved {
                let utc = dt.with_timezone(&Utc);
                if utc > after {
                    return Some(utc);
                }
            }
            from = candidate + Duration::seconds(1);
        }
    }
}

/// First valid instant after a spring-forward gap containing `inside`.
fn gap_end(tz: Tz, inside: NaiveDateTime) -> Option<DateTime<Tz>> {
    let mut probe = inside.with_second(0)?.with_nanosecond(0)?;
    for _ in 0..(24 * 60) {
        probe += Duration::minutes(1);
        if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
            return Some(dt);
        }
    }
    None
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn invalid(expression: &str, reason: String) -> SchedulerError {
    SchedulerError::InvalidScheduleSpec(format!("cron {expression:?}: {reason}"))
}

/// Parse one field into a bitset. Returns whether the field restricts values.
fn parse_field(
    expression: &str,
    text: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> Result<(FieldSet, bool)> {
    let restricted = text != "*" && text != "?";
    let mut bits = 0u64;

    for part in text.split(',') {
        if part.is_empty() {
            return Err(invalid(expression, format!("empty list item in {text:?}")));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expression, format!("bad step in {part:?}")))?;
                if step == 0 {
                    return Err(invalid(expression, format!("zero step in {part:?}")));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_value(expression, a, names)?,
                parse_value(expression, b, names)?,
            )
        } else {
            let v = parse_value(expression, range, names)?;
            // "5/15" means "from 5 to the end, every 15"
            if step.is_some() {
                (v, max)
            } else {
                (v, v)
            }
        };

        if start < min || end > max {
            return Err(invalid(
                expression,
                format!("{part:?} outside {min}-{max}"),
            ));
        }
        if start > end {
            return Err(invalid(expression, format!("reversed range {part:?}")));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (start..=end).step_by(step) {
            bits |= 1 << v;
        }
    }

    Ok((FieldSet(bits), restricted))
}

fn parse_value(expression: &str, text: &str, names: Option<(&[&str], u32)>) -> Result<u32> {
    if let Ok(v) = text.parse::<u32>() {
        return Ok(v);
    }
    if let Some((table, base)) = names {
        let upper = text.to_ascii_uppercase();
        if let Some(pos) = table.iter().position(|n| *n == upper) {
            return Ok(pos as u32 + base);
        }
    }
    Err(invalid(expression, format!("bad value {text:?}")))
}
