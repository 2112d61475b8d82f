//! Cron expression parsing and evaluation.
//!
//! Supports the standard 5-field format: `minute hour day month weekday`,
//! with weekday 0 = Sunday. Each field accepts `*`, single values, comma
//! lists, inclusive `a-b` ranges, and `*/n` or `a/n` steps.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scan bound for [`CronExpression::next_after`]: five years of minutes.
///
/// Every reachable schedule repeats within a year; the slack covers leap-day
/// expressions (`0 0 29 2 *`). Unsatisfiable day/month combinations such as
/// `0 0 31 2 *` hit the bound and yield `None` instead of looping forever.
const SCAN_BOUND_DAYS: i64 = 366 * 5;

/// Errors from parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// Wrong number of whitespace-separated fields.
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    /// A token that is not a recognized field form.
    #[error("invalid {field} token: {token:?}")]
    InvalidToken { field: &'static str, token: String },

    /// A numeric value outside the field's bounds.
    #[error("{field} value out of range {min}-{max}: {token:?}")]
    OutOfRange {
        field: &'static str,
        min: u32,
        max: u32,
        token: String,
    },
}

/// A parsed cron expression.
///
/// Serializes as its source string, so a `CronExpression` held by a task is
/// valid by construction: deserialization re-parses and rejects bad input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression {
    source: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

impl CronExpression {
    /// Parse a 5-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field("minute", fields[0], 0, 59)?,
            hours: parse_field("hour", fields[1], 0, 23)?,
            days: parse_field("day", fields[2], 1, 31)?,
            months: parse_field("month", fields[3], 1, 12)?,
            weekdays: parse_field("weekday", fields[4], 0, 6)?,
        })
    }

    /// The normalized source text of this expression.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Check whether the expression matches the given instant.
    ///
    /// Day-of-month and weekday are both required to match when both are
    /// restricted. Traditional cron ORs them in that case; this scheduler
    /// has always ANDed them, and callers depend on that.
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.minutes.contains(&time.minute())
            && self.hours.contains(&time.hour())
            && self.days.contains(&time.day())
            && self.months.contains(&time.month())
            && self.weekdays.contains(&time.weekday().num_days_from_sunday())
    }

    /// The smallest minute-aligned instant strictly after `after` that
    /// matches this expression.
    ///
    /// Advances the least-significant non-matching field and zeroes the
    /// fields below it, so the search skips whole months, days, and hours
    /// at a time. Returns `None` only for expressions with no reachable
    /// instant within the scan bound (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut time = truncate_to_minute(after) + Duration::minutes(1);
        let bound = *after + Duration::days(SCAN_BOUND_DAYS);

        while time <= bound {
            if !self.months.contains(&time.month()) {
                let (year, month) = if time.month() == 12 {
                    (time.year() + 1, 1)
                } else {
                    (time.year(), time.month() + 1)
                };
                time = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }

            if !self.days.contains(&time.day())
                || !self.weekdays.contains(&time.weekday().num_days_from_sunday())
            {
                time = truncate_to_minute(&(time + Duration::days(1)))
                    .with_hour(0)?
                    .with_minute(0)?;
                continue;
            }

            if !self.hours.contains(&time.hour()) {
                time = truncate_to_minute(&(time + Duration::hours(1))).with_minute(0)?;
                continue;
            }

            if !self.minutes.contains(&time.minute()) {
                match self.minutes.range(time.minute() + 1..).next() {
                    Some(&minute) => time = time.with_minute(minute)?,
                    // No later member this hour; roll to the next hour's
                    // first member and re-check the hour field.
                    None => {
                        let first = *self.minutes.iter().next()?;
                        time = (time + Duration::hours(1)).with_minute(first)?;
                    }
                }
                continue;
            }

            return Some(time);
        }

        None
    }
}

/// Drop seconds and sub-second precision.
fn truncate_to_minute(time: &DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        0,
    )
    .single()
    .expect("UTC date-times are unambiguous")
}

/// Parse one cron field into its set of matching values.
fn parse_field(
    field: &'static str,
    text: &str,
    min: u32,
    max: u32,
) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    for token in text.split(',') {
        parse_token(field, token, min, max, &mut values)?;
    }
    Ok(values)
}

/// Parse a single comma-list token: `*`, `n`, `a-b`, `*/n`, or `a/n`.
fn parse_token(
    field: &'static str,
    token: &str,
    min: u32,
    max: u32,
    values: &mut BTreeSet<u32>,
) -> Result<(), CronError> {
    let invalid = || CronError::InvalidToken {
        field,
        token: token.to_string(),
    };
    let out_of_range = || CronError::OutOfRange {
        field,
        min,
        max,
        token: token.to_string(),
    };

    let (base, step) = match token.split_once('/') {
        Some((base, step_str)) => {
            let step: u32 = step_str.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(invalid());
            }
            (base, step)
        }
        None => (token, 1),
    };

    let (start, end) = if base == "*" {
        (min, max)
    } else if let Some((lo, hi)) = base.split_once('-') {
        let lo: u32 = lo.parse().map_err(|_| invalid())?;
        let hi: u32 = hi.parse().map_err(|_| invalid())?;
        if lo > hi {
            return Err(invalid());
        }
        (lo, hi)
    } else {
        let value: u32 = base.parse().map_err(|_| invalid())?;
        // A bare value with a step (`5/10`) strides to the field max.
        if step > 1 { (value, max) } else { (value, value) }
    };

    if start < min || end > max {
        return Err(out_of_range());
    }

    values.extend((start..=end).step_by(step as usize));
    Ok(())
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = CronError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CronExpression> for String {
    fn from(expr: CronExpression) -> Self {
        expr.source
    }
}
