//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, `n`, `a-b`, `*/n`, `a-b/n`, `a/n` and comma lists.
//! Months and weekdays also accept three-letter names; weekday 7 is Sunday.
//! All evaluation happens in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Search horizon. Covers a full leap-year cycle so `0 0 29 2 *` still resolves.
const MAX_DAYS_AHEAD: u32 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("cron expression must have 5 fields (minute hour day month weekday), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Offset added to a name's index (months are 1-based).
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, name_base: 1 };
// 7 is accepted as an alias for Sunday and folded onto 0 after parsing.
const WEEKDAY: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES, name_base: 0 };

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
    /// False when the field text starts with `*` (matters for day matching).
    restricted: bool,
}

impl CronField {
    fn contains(self, v: u32) -> bool {
        v < 64 && self.bits & (1u64 << v) != 0
    }

    fn parse(text: &str, spec: FieldSpec) -> Result<Self, CronParseError> {
        let invalid = |reason: String| CronParseError::InvalidField {
            field: spec.name,
            value: text.to_string(),
            reason,
        };

        let mut bits = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s
                        .parse()
                        .map_err(|_| invalid(format!("step {s:?} is not a number")))?;
                    if step == 0 {
                        return Err(invalid("step must be positive".into()));
                    }
                    (r, Some(step))
                }
                None => (part, None),
            };

            let (lo, hi) = if range == "*" {
                (spec.min, spec.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_value(a, spec).map_err(invalid)?, parse_value(b, spec).map_err(invalid)?)
            } else {
                let v = parse_value(range, spec).map_err(invalid)?;
                // `a/n` means "from a to the end of the range every n"
                if step.is_some() {
                    (v, spec.max)
                } else {
                    (v, v)
                }
            };

            if lo > hi {
                return Err(invalid(format!("range {lo}-{hi} is reversed")));
            }

            let step = step.unwrap_or(1) as usize;
            for v in (lo..=hi).step_by(step) {
                bits |= 1u64 << v;
            }
        }

        if bits == 0 {
            return Err(invalid("field selects no values".into()));
        }

        Ok(Self {
            bits,
            restricted: !text.starts_with('*'),
        })
    }
}

fn parse_value(s: &str, spec: FieldSpec) -> Result<u32, String> {
    let lower = s.to_ascii_lowercase();
    if let Some(idx) = spec.names.iter().position(|n| *n == lower) {
        return Ok(idx as u32 + spec.name_base);
    }
    let v: u32 = s
        .parse()
        .map_err(|_| format!("{s:?} is not a number"))?;
    if v < spec.min || v > spec.max {
        return Err(format!("{v} out of range ({}-{})", spec.min, spec.max));
    }
    Ok(v)
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: CronField,
    hours: CronField,
    days: CronField,
    months: CronField,
    weekdays: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(parts.len()));
        }

        let mut weekdays = CronField::parse(parts[4], WEEKDAY)?;
        if weekdays.contains(7) {
            weekdays.bits = (weekdays.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: CronField::parse(parts[0], MINUTE)?,
            hours: CronField::parse(parts[1], HOUR)?,
            days: CronField::parse(parts[2], DAY)?,
            months: CronField::parse(parts[3], MONTH)?,
            weekdays,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = truncate_to_minute(after)?;
        self.search(floor.checked_add_signed(Duration::minutes(1))?)
    }

    /// First matching minute at or after `from`.
    pub fn next_at_or_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = truncate_to_minute(from)?;
        if floor == from {
            self.search(floor)
        } else {
            self.search(floor.checked_add_signed(Duration::minutes(1))?)
        }
    }

    /// Whether `t` (at minute granularity) matches the expression.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.day_matches(t.date_naive())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days.contains(date.day());
        let dow = self.weekdays.contains(date.weekday().num_days_from_sunday());
        // Standard cron: two restricted day fields are OR-ed.
        if self.days.restricted && self.weekdays.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn search(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut date = start.date_naive();
        for day in 0..MAX_DAYS_AHEAD {
            if self.day_matches(date) {
                let (h0, m0) = if day == 0 {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for h in (h0..24).filter(|h| self.hours.contains(*h)) {
                    let from_minute = if day == 0 && h == h0 { m0 } else { 0 };
                    if let Some(m) = (from_minute..60).find(|m| self.minutes.contains(*m)) {
                        let naive = date.and_hms_opt(h, m, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_second(0)?.with_nanosecond(0)
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
