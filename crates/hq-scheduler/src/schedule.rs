use std::fmt;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::{
    cron::CronExpr,
    error::{Result, SchedulerError},
    types::{Schedule, TimeOfDay, TimeUnit},
};

/// Catch-up bound for calendar units after a long outage.
const MAX_CATCH_UP_STEPS: u32 = 100_000;

/// Reject schedules that can never produce a fire time.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Interval { interval, unit, at } => {
            if *interval == 0 {
                return Err(SchedulerError::validation("interval must be positive"));
            }
            if at.is_some() && !unit.supports_at() {
                return Err(SchedulerError::validation(format!(
                    "'at' is only supported for days/weeks, not {unit}"
                )));
            }
            Ok(())
        }
        Schedule::Expression(expr) => {
            let cron = parse_cron(expr)?;
            if cron.next_after(Utc::now()).is_none() {
                return Err(SchedulerError::validation(format!(
                    "cron expression {expr:?} never fires"
                )));
            }
            Ok(())
        }
    }
}

/// Earliest valid fire time at or after `anchor`.
///
/// `anchor` is the job's creation time, or its `start_date` when that is later.
/// A plain interval first fires one full interval after the anchor.
pub fn first_run(schedule: &Schedule, anchor: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        Schedule::Interval {
            interval,
            unit,
            at: None,
        } => advance(*unit, anchor, *interval),

        Schedule::Interval {
            unit, at: Some(at), ..
        } => {
            let candidate = at_on_same_day(anchor, *at);
            if candidate >= anchor {
                Ok(candidate)
            } else {
                advance(*unit, candidate, 1)
            }
        }

        Schedule::Expression(expr) => parse_cron(expr)?
            .next_at_or_after(anchor)
            .ok_or_else(|| SchedulerError::validation(format!("cron {expr:?} never fires"))),
    }
}

/// Next fire time after a firing at `fired_at`, guaranteed to be after `now`.
///
/// Interval arithmetic anchors on `fired_at` (the scheduled instant), never on
/// when the execution finished, so run time does not shift the grid. Whole
/// periods that ended at or before `now` are skipped, not replayed. Month and
/// year steps count from `anchor`, so a day clamped in a short month
/// (Jan 31 → Feb 28) comes back on the 31st afterwards.
pub fn next_run(
    schedule: &Schedule,
    anchor: DateTime<Utc>,
    fired_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match schedule {
        Schedule::Interval {
            interval,
            unit,
            at: None,
        } => {
            let Some(step) = fixed_step(*unit, *interval) else {
                return calendar_step(*unit, *interval, anchor, fired_at.max(now));
            };
            let next = advance(*unit, fired_at, *interval)?;
            if next > now {
                return Ok(next);
            }
            let step_ms = step.num_milliseconds().max(1);
            let behind_ms = (now - fired_at).num_milliseconds();
            let periods = behind_ms / step_ms + 1;
            let offset = Duration::try_milliseconds(periods.saturating_mul(step_ms))
                .ok_or_else(|| overflow(schedule))?;
            fired_at
                .checked_add_signed(offset)
                .ok_or_else(|| overflow(schedule))
        }

        Schedule::Interval {
            interval,
            unit,
            at: Some(at),
        } => {
            let day = advance(*unit, fired_at, *interval)?;
            let candidate = at_on_same_day(day, *at);
            step_until_after(candidate, now, |t| advance(*unit, t, 1))
        }

        Schedule::Expression(expr) => {
            let from = if fired_at > now { fired_at } else { now };
            parse_cron(expr)?
                .next_after(from)
                .ok_or_else(|| SchedulerError::validation(format!("cron {expr:?} never fires")))
        }
    }
}

fn parse_cron(expr: &str) -> Result<CronExpr> {
    CronExpr::parse(expr).map_err(|e| SchedulerError::validation(e.to_string()))
}

fn advance(unit: TimeUnit, from: DateTime<Utc>, n: u32) -> Result<DateTime<Utc>> {
    unit.advance(from, n)
        .ok_or_else(|| SchedulerError::validation(format!("{n} {unit} from {from} overflows")))
}

fn fixed_step(unit: TimeUnit, n: u32) -> Option<Duration> {
    let n = i64::from(n);
    match unit {
        TimeUnit::Seconds => Duration::try_seconds(n),
        TimeUnit::Minutes => Duration::try_minutes(n),
        TimeUnit::Hours => Duration::try_hours(n),
        TimeUnit::Days => Duration::try_days(n),
        TimeUnit::Weeks => Duration::try_weeks(n),
        TimeUnit::Months | TimeUnit::Years => None,
    }
}

/// First `anchor + k·n` units (k ≥ 1) strictly after `after`, for month and
/// year intervals.
fn calendar_step(
    unit: TimeUnit,
    n: u32,
    anchor: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let months_per_step = match unit {
        TimeUnit::Years => i64::from(n) * 12,
        _ => i64::from(n),
    };
    let months_apart = i64::from(after.year() - anchor.year()) * 12
        + i64::from(after.month()) - i64::from(anchor.month());
    // earlier k land in an earlier month, so none of them can be after `after`
    let mut k = u32::try_from(months_apart / months_per_step.max(1))
        .unwrap_or(0)
        .max(1);
    for _ in 0..MAX_CATCH_UP_STEPS {
        let steps = k
            .checked_mul(n)
            .ok_or_else(|| SchedulerError::validation(format!("{k} x {n} {unit} overflows")))?;
        let t = advance(unit, anchor, steps)?;
        if t > after {
            return Ok(t);
        }
        k += 1;
    }
    Err(SchedulerError::validation(format!(
        "could not find a fire time after {after}"
    )))
}

fn step_until_after(
    mut t: DateTime<Utc>,
    now: DateTime<Utc>,
    step: impl Fn(DateTime<Utc>) -> Result<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    for _ in 0..MAX_CATCH_UP_STEPS {
        if t > now {
            return Ok(t);
        }
        t = step(t)?;
    }
    Err(SchedulerError::validation(format!(
        "could not find a fire time after {now}"
    )))
}

fn at_on_same_day(day: DateTime<Utc>, at: TimeOfDay) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.date_naive().and_time(at.as_naive()))
}

fn overflow(schedule: &Schedule) -> SchedulerError {
    SchedulerError::validation(format!("schedule {schedule} overflows"))
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { interval, unit, at } => {
                if *interval == 1 {
                    let singular = match unit {
                        TimeUnit::Days => "day",
                        TimeUnit::Seconds => "second",
                        TimeUnit::Minutes => "minute",
                        TimeUnit::Hours => "hour",
                        TimeUnit::Weeks => "week",
                        TimeUnit::Months => "month",
                        TimeUnit::Years => "year",
                    };
                    write!(f, "Every {singular}")?;
                } else {
                    write!(f, "Every {interval} {unit}")?;
                }
                if let Some(at) = at {
                    write!(f, " at {at}")?;
                }
                Ok(())
            }
            Schedule::Expression(expr) => write!(f, "Cron: {expr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn daily_at(h: u8, m: u8) -> Schedule {
        Schedule::Interval {
            interval: 1,
            unit: TimeUnit::Days,
            at: TimeOfDay::new(h, m),
        }
    }

    #[test]
    fn hourly_first_run_is_one_interval_after_creation() {
        let t = at(2025, 6, 1, 10, 0);
        let first = first_run(&Schedule::every(1, TimeUnit::Hours), t).unwrap();
        assert_eq!(first, at(2025, 6, 1, 11, 0));
    }

    #[test]
    fn interval_next_run_ignores_execution_latency() {
        let s = Schedule::every(1, TimeUnit::Hours);
        let fired = at(2025, 6, 1, 11, 0);
        // dispatch noticed it 400ms late; completion time never enters the math
        let now = fired + Duration::milliseconds(400);
        assert_eq!(next_run(&s, fired, fired, now).unwrap(), at(2025, 6, 1, 12, 0));
    }

    #[test]
    fn interval_skips_periods_missed_during_outage() {
        let s = Schedule::every(15, TimeUnit::Minutes);
        let fired = at(2025, 6, 1, 10, 0);
        let now = at(2025, 6, 1, 11, 7);
        assert_eq!(next_run(&s, fired, fired, now).unwrap(), at(2025, 6, 1, 11, 15));
        // landing exactly on a boundary must still move strictly past now
        let now = at(2025, 6, 1, 11, 15);
        assert_eq!(next_run(&s, fired, fired, now).unwrap(), at(2025, 6, 1, 11, 30));
    }

    #[test]
    fn monthly_interval_catches_up_with_calendar_steps() {
        let s = Schedule::every(1, TimeUnit::Months);
        let anchor = at(2024, 12, 15, 0, 0);
        let fired = at(2025, 1, 15, 0, 0);
        let now = at(2025, 4, 20, 0, 0);
        assert_eq!(next_run(&s, anchor, fired, now).unwrap(), at(2025, 5, 15, 0, 0));
    }

    #[test]
    fn month_end_day_returns_after_a_short_month() {
        let s = Schedule::every(1, TimeUnit::Months);
        let anchor = at(2024, 12, 31, 9, 0);
        assert_eq!(first_run(&s, anchor).unwrap(), at(2025, 1, 31, 9, 0));

        let feb = next_run(&s, anchor, at(2025, 1, 31, 9, 0), at(2025, 1, 31, 9, 0)).unwrap();
        assert_eq!(feb, at(2025, 2, 28, 9, 0));
        let mar = next_run(&s, anchor, feb, feb + Duration::seconds(1)).unwrap();
        assert_eq!(mar, at(2025, 3, 31, 9, 0));
        let apr = next_run(&s, anchor, mar, mar).unwrap();
        assert_eq!(apr, at(2025, 4, 30, 9, 0));
    }

    #[test]
    fn yearly_interval_steps_from_the_anchor() {
        let s = Schedule::every(1, TimeUnit::Years);
        let anchor = at(2024, 2, 29, 0, 0);
        let fired = at(2025, 2, 28, 0, 0);
        assert_eq!(next_run(&s, anchor, fired, fired).unwrap(), at(2026, 2, 28, 0, 0));
        let fired = at(2027, 2, 28, 0, 0);
        assert_eq!(next_run(&s, anchor, fired, fired).unwrap(), at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn daily_at_first_run_today_or_tomorrow() {
        let s = daily_at(8, 0);
        assert_eq!(first_run(&s, at(2025, 6, 1, 7, 30)).unwrap(), at(2025, 6, 1, 8, 0));
        assert_eq!(first_run(&s, at(2025, 6, 1, 8, 0)).unwrap(), at(2025, 6, 1, 8, 0));
        assert_eq!(first_run(&s, at(2025, 6, 1, 9, 0)).unwrap(), at(2025, 6, 2, 8, 0));
    }

    #[test]
    fn weekly_at_first_run_pushes_a_week() {
        let s = Schedule::Interval {
            interval: 1,
            unit: TimeUnit::Weeks,
            at: TimeOfDay::new(2, 0),
        };
        assert_eq!(first_run(&s, at(2025, 6, 1, 3, 0)).unwrap(), at(2025, 6, 8, 2, 0));
    }

    #[test]
    fn at_schedule_next_run_lands_on_clock_time() {
        let s = Schedule::Interval {
            interval: 2,
            unit: TimeUnit::Days,
            at: TimeOfDay::new(6, 30),
        };
        let fired = at(2025, 6, 1, 6, 30);
        assert_eq!(
            next_run(&s, fired, fired, fired + Duration::seconds(1)).unwrap(),
            at(2025, 6, 3, 6, 30)
        );
        // computed time not after now → one more unit
        assert_eq!(
            next_run(&s, fired, fired, at(2025, 6, 3, 7, 0)).unwrap(),
            at(2025, 6, 4, 6, 30)
        );
    }

    #[test]
    fn cron_next_run_is_strictly_after_now() {
        let s = Schedule::cron("*/15 * * * *");
        let fired = at(2025, 6, 1, 12, 0);
        assert_eq!(
            next_run(&s, fired, fired, at(2025, 6, 1, 12, 7)).unwrap(),
            at(2025, 6, 1, 12, 15)
        );
        assert_eq!(first_run(&s, at(2025, 6, 1, 12, 7)).unwrap(), at(2025, 6, 1, 12, 15));
    }

    #[test]
    fn validation_rejects_bad_schedules() {
        assert!(validate(&Schedule::every(0, TimeUnit::Days)).is_err());
        let hourly_at = Schedule::Interval {
            interval: 1,
            unit: TimeUnit::Hours,
            at: TimeOfDay::new(8, 0),
        };
        assert!(validate(&hourly_at).is_err());
        assert!(validate(&Schedule::cron("not a cron")).is_err());
        assert!(validate(&Schedule::cron("0 0 31 2 *")).is_err());
        assert!(validate(&daily_at(8, 0)).is_ok());
        assert!(validate(&Schedule::cron("0 8 * * 1-5")).is_ok());
    }

    #[test]
    fn human_readable_descriptions() {
        assert_eq!(Schedule::every(2, TimeUnit::Hours).to_string(), "Every 2 hours");
        assert_eq!(Schedule::every(1, TimeUnit::Hours).to_string(), "Every hour");
        assert_eq!(daily_at(9, 30).to_string(), "Every day at 09:30");
        assert_eq!(Schedule::cron("0 0 * * *").to_string(), "Cron: 0 0 * * *");
    }
}
