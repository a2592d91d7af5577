use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::types::Schedule;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

impl Schedule {
    pub fn single(at: DateTime<Utc>) -> Self {
        Schedule::Single { at }
    }

    /// Fixed-interval schedule. The interval must be a positive number of seconds.
    pub fn interval(start: DateTime<Utc>, every_secs: i64) -> Result<Self> {
        let every = u64::try_from(every_secs)
            .ok()
            .and_then(NonZeroU64::new)
            .ok_or_else(|| {
                QueueError::InvalidSchedule(format!(
                    "interval must be a positive number of seconds, got {every_secs}"
                ))
            })?;
        Ok(Schedule::Interval {
            start,
            every_secs: every,
        })
    }

    /// Like [`Schedule::interval`], rejecting fractional and non-finite input.
    pub fn interval_from_f64(start: DateTime<Utc>, every_secs: f64) -> Result<Self> {
        if !every_secs.is_finite() || every_secs.fract() != 0.0 || every_secs > i64::MAX as f64 {
            return Err(QueueError::InvalidSchedule(format!(
                "interval must be a whole number of seconds, got {every_secs}"
            )));
        }
        Self::interval(start, every_secs as i64)
    }

    /// Parse an interval given as text, e.g. from a CLI or config file.
    pub fn interval_from_str(start: DateTime<Utc>, every_secs: &str) -> Result<Self> {
        let trimmed = every_secs.trim();
        if let Ok(whole) = trimmed.parse::<i64>() {
            return Self::interval(start, whole);
        }
        match trimmed.parse::<f64>() {
            Ok(value) => Self::interval_from_f64(start, value),
            Err(_) => Err(QueueError::InvalidSchedule(format!(
                "interval is not a number: '{trimmed}'"
            ))),
        }
    }

    /// Cron schedule evaluated in `timezone` (an IANA name such as `Europe/Berlin`).
    pub fn cron(start: DateTime<Utc>, expression: &str, timezone: &str) -> Result<Self> {
        Ok(Schedule::Cron {
            start,
            cron: CronSpec::new(expression, timezone)?,
        })
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Schedule::Interval { .. } | Schedule::Cron { .. })
    }

    /// When the first instance is due. `None` for the null schedule, which is due on save.
    pub fn first_run(&self) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Null => None,
            _ => self.next(None),
        }
    }

    /// Next run strictly after `after`, or the schedule's own first date when
    /// `after` is omitted. `None` means the schedule is exhausted.
    pub fn next(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Null => None,

            Schedule::Single { at } => match after {
                None => Some(*at),
                Some(after) => (*at > after).then_some(*at),
            },

            Schedule::Interval { start, every_secs } => {
                let after = match after {
                    Some(after) if after >= *start => after,
                    _ => return Some(*start),
                };
                // Land on the cadence boundary: start + k*every, smallest k with result > after.
                let every = i64::try_from(every_secs.get()).ok()?;
                let elapsed = (after - *start).num_seconds();
                let k = (elapsed / every).checked_add(1)?;
                let offset = TimeDelta::try_seconds(k.checked_mul(every)?)?;
                start.checked_add_signed(offset)
            }

            Schedule::Cron { start, cron } => {
                // Occurrences at `start` itself count, so search from one second before.
                let floor = start.trunc_subsecs(0) - TimeDelta::seconds(1);
                let from = match after {
                    Some(after) if after > floor => after,
                    _ => floor,
                };
                cron.next_after(from)
            }
        }
    }
}

/// A validated 5-field cron expression bound to a timezone.
///
/// Fields are `minute hour day-of-month month day-of-week`, with day-of-week
/// numbered 0-7 (0 and 7 are Sunday) or named `SUN`..`SAT`. The `@hourly`,
/// `@daily`, `@weekly`, `@monthly` and `@yearly` shorthands are accepted.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "RawCronSpec", into = "RawCronSpec")]
pub struct CronSpec {
    expression: String,
    timezone: Tz,
    compiled: cron::Schedule,
}

#[derive(Serialize, Deserialize)]
struct RawCronSpec {
    expression: String,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl CronSpec {
    pub fn new(expression: &str, timezone: &str) -> Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| QueueError::InvalidSchedule(format!("unknown timezone '{timezone}'")))?;
        Self::with_timezone(expression, tz)
    }

    pub fn with_timezone(expression: &str, timezone: Tz) -> Result<Self> {
        let translated = to_six_field(expression)?;
        let compiled = cron::Schedule::from_str(&translated).map_err(|e| {
            QueueError::InvalidSchedule(format!("invalid cron expression '{expression}': {e}"))
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            timezone,
            compiled,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First occurrence strictly after `after`, evaluated in this expression's timezone.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.compiled
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }
}

impl fmt::Debug for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSpec")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl PartialEq for CronSpec {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

impl TryFrom<RawCronSpec> for CronSpec {
    type Error = QueueError;

    fn try_from(raw: RawCronSpec) -> Result<Self> {
        CronSpec::new(&raw.expression, &raw.timezone)
    }
}

impl From<CronSpec> for RawCronSpec {
    fn from(cron: CronSpec) -> Self {
        RawCronSpec {
            expression: cron.expression,
            timezone: cron.timezone.name().to_string(),
        }
    }
}

/// Rewrite a 5-field expression into the seconds-first form the `cron` crate parses.
fn to_six_field(expression: &str) -> Result<String> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(QueueError::InvalidSchedule(format!(
            "cron expression '{trimmed}' must have 5 fields, found {}",
            fields.len()
        )));
    }
    let day_of_week = day_of_week_field(fields[4])?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    ))
}

/// Expand a day-of-week field into explicit day names.
///
/// The `cron` crate numbers days 1-7 from Sunday; names avoid the off-by-one.
fn day_of_week_field(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| invalid_day(part))?;
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (day_number(lo)?, day_number(hi)?)
        } else {
            let day = day_number(range)?;
            // `5/2` means "from Friday, every second day".
            (day, if step > 1 { 7 } else { day })
        };
        if lo > hi {
            return Err(invalid_day(part));
        }
        for day in (lo..=hi).step_by(step) {
            days[day % 7] = true;
        }
    }
    let names: Vec<&str> = days
        .iter()
        .zip(DAY_NAMES)
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
    Ok(names.join(","))
}

fn day_number(token: &str) -> Result<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 { Ok(n) } else { Err(invalid_day(token)) };
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| invalid_day(token))
}

fn invalid_day(token: &str) -> QueueError {
    QueueError::InvalidSchedule(format!("invalid day-of-week '{token}'"))
}
