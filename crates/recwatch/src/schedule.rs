//! Recurrence expressions for the observation scheduler.
//!
//! Accepted forms:
//! - `@every <duration>` with units `ms`, `s`, `m`, `h` (e.g. `@every 1m30s`)
//! - descriptors: `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`
//! - 5-field cron (`min hour dom month dow`), evaluated at second 0, with
//!   day-of-week numbered 0-6 from Sunday (7 is also Sunday)
//! - 6/7-field cron with seconds (and optional year)
//!
//! Cron expressions are evaluated in UTC.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Default firing interval.
pub const DEFAULT_RECURRENCE: &str = "@every 1m";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Empty schedule expression")]
    Empty,

    #[error("Invalid interval {0:?}: expected e.g. 30s, 1m, 1h30m")]
    InvalidDuration(String),

    #[error("Interval must be greater than zero")]
    ZeroInterval,

    #[error("Expected 5, 6 or 7 cron fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}

#[derive(Debug, Clone)]
enum Kind {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

/// A parsed recurrence expression.
#[derive(Debug, Clone)]
pub struct Recurrence {
    expression: String,
    kind: Kind,
}

impl Recurrence {
    /// A fixed-interval recurrence.
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Self {
            expression: format!("@every {interval:?}"),
            kind: Kind::Every(interval),
        })
    }

    /// The expression this recurrence was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The fixed interval, if this is an `@every` recurrence.
    pub fn interval(&self) -> Option<Duration> {
        match self.kind {
            Kind::Every(d) => Some(d),
            Kind::Cron(_) => None,
        }
    }

    /// The first firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Every(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| now.checked_add_signed(d)),
            Kind::Cron(schedule) => schedule.after(&now).next(),
        }
    }

    /// Time to wait from `now` until the next firing.
    ///
    /// `None` means the recurrence never fires again.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_firing(now, None).map(|(_, delay)| delay)
    }

    /// The next firing instant and the wait until it.
    ///
    /// Cron slots are taken strictly after `previous` as well as after `now`,
    /// so a wall clock that lags the timer never yields the same slot twice.
    pub fn next_firing(
        &self,
        now: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> Option<(DateTime<Utc>, Duration)> {
        match &self.kind {
            Kind::Every(d) => {
                let at = self.next_after(now)?;
                Some((at, *d))
            }
            Kind::Cron(_) => {
                let from = previous.map_or(now, |prev| prev.max(now));
                let at = self.next_after(from)?;
                Some((at, (at - now).to_std().unwrap_or_default()))
            }
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl Default for Recurrence {
    fn default() -> Self {
        Self {
            expression: DEFAULT_RECURRENCE.to_string(),
            kind: Kind::Every(Duration::from_secs(60)),
        }
    }
}

impl FromStr for Recurrence {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expr = s.trim();
        if expr.is_empty() {
            return Err(ScheduleError::Empty);
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_interval(rest.trim())?;
            if interval.is_zero() {
                return Err(ScheduleError::ZeroInterval);
            }
            return Ok(Self {
                expression: expr.to_string(),
                kind: Kind::Every(interval),
            });
        }

        let cron_expr = if expr.starts_with('@') {
            expr.to_string()
        } else {
            let fields: Vec<&str> = expr.split_whitespace().collect();
            match fields.len() {
                5 => {
                    let dow = standard_day_of_week(fields[4]).map_err(|reason| {
                        ScheduleError::InvalidCron {
                            expr: expr.to_string(),
                            reason,
                        }
                    })?;
                    format!("0 {} {dow}", fields[..4].join(" "))
                }
                6 | 7 => expr.to_string(),
                n => return Err(ScheduleError::FieldCount(n)),
            }
        };

        let schedule = cron::Schedule::from_str(&cron_expr).map_err(|e| {
            ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            expression: expr.to_string(),
            kind: Kind::Cron(Box::new(schedule)),
        })
    }
}

/// Rewrites a standard day-of-week field (0 or 7 = Sunday, 6 = Saturday)
/// into the 1 = Sunday ... 7 = Saturday numbering of the `cron` crate.
///
/// Wildcards keep their meaning under the shift, so `*`, `?` and `*/n` pass
/// through. Named days are left alone. Numeric values, ranges and stepped
/// ranges are expanded into an explicit list.
fn standard_day_of_week(field: &str) -> Result<String, String> {
    let mut out: Vec<String> = Vec::new();
    let mut days: Vec<u8> = Vec::new();

    for element in field.split(',') {
        let (base, step) = match element.split_once('/') {
            Some((base, step)) => {
                let step: u8 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in {element:?}"))?;
                (base, Some(step))
            }
            None => (element, None),
        };

        if base == "*" || base == "?" || base.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(element.to_string());
            continue;
        }

        let day = |s: &str| -> Result<u8, String> {
            s.parse::<u8>()
                .ok()
                .filter(|d| *d <= 7)
                .ok_or_else(|| format!("day of week {s:?} is outside 0-7"))
        };
        let (start, end) = match base.split_once('-') {
            Some((a, b)) => (day(a)?, day(b)?),
            None => {
                let d = day(base)?;
                (d, if step.is_some() { 6 } else { d })
            }
        };
        if start > end {
            return Err(format!("day-of-week range {base:?} is reversed"));
        }

        let step = usize::from(step.unwrap_or(1));
        days.extend((start..=end).step_by(step).map(|d| d % 7 + 1));
    }

    days.sort_unstable();
    days.dedup();
    out.extend(days.iter().map(u8::to_string));
    Ok(out.join(","))
}

/// Parses a compound interval such as `1h30m`, `45s` or `250ms`.
pub fn parse_interval(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidDuration(s.to_string());
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total = total.saturating_add(part);
    }

    Ok(total)
}
