//! Pure computation of "next run time" from a recurrence rule.
//!
//! Second/minute/hour rules are plain arithmetic on unix time. Day/week/
//! month/year rules advance the calendar in the time zone the last run
//! happened in, then snap to the configured weekday or day-of-month and
//! time-of-day.

use chrono::{Datelike, Days, Local, Months, NaiveDate, TimeZone, Utc};

/// Unit of a recurrence interval, as stored on schedule rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
    /// Fires exactly once, then stops forever.
    Once,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
            IntervalUnit::Weeks => "weeks",
            IntervalUnit::Months => "months",
            IntervalUnit::Years => "years",
            IntervalUnit::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seconds" => Some(IntervalUnit::Seconds),
            "minutes" => Some(IntervalUnit::Minutes),
            "hours" => Some(IntervalUnit::Hours),
            "days" => Some(IntervalUnit::Days),
            "weeks" => Some(IntervalUnit::Weeks),
            "months" => Some(IntervalUnit::Months),
            "years" => Some(IntervalUnit::Years),
            "once" => Some(IntervalUnit::Once),
            _ => None,
        }
    }
}

/// An immutable recurrence rule.
///
/// `at_day` means a weekday (0 = Sunday .. 6 = Saturday) for weekly rules
/// and a day-of-month for monthly/yearly rules. A day-of-month past the end
/// of the target month rolls into the following month; deployments rely on
/// this, so it is preserved rather than clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub unit: IntervalUnit,
    pub value: i64,
    pub at_hour: u32,
    pub at_minute: u32,
    pub at_second: u32,
    pub at_day: Option<u32>,
}

impl RecurrenceRule {
    /// Plain fixed-interval rule in seconds, as used by system tasks.
    pub fn every_seconds(value: i64) -> Self {
        Self {
            unit: IntervalUnit::Seconds,
            value,
            at_hour: 0,
            at_minute: 0,
            at_second: 0,
            at_day: None,
        }
    }
}

/// Outcome of a next-run computation. `Stopped` marks a schedule that will
/// never fire again (a spent `once` rule, or calendar math that could not be
/// resolved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    At(i64),
    Stopped,
}

impl NextRun {
    pub fn is_stopped(&self) -> bool {
        matches!(self, NextRun::Stopped)
    }

    pub fn is_due(&self, now: i64) -> bool {
        matches!(self, NextRun::At(at) if *at <= now)
    }

    /// Candidate-wins rule for picking the earliest schedule of a task: a
    /// stopped incumbent loses to any scheduled candidate, and a strictly
    /// earlier candidate wins. Exact ties keep the incumbent.
    pub fn wins_over(&self, incumbent: &NextRun) -> bool {
        match (self, incumbent) {
            (NextRun::At(_), NextRun::Stopped) => true,
            (NextRun::At(candidate), NextRun::At(current)) => candidate < current,
            (NextRun::Stopped, _) => false,
        }
    }
}

/// Compute the next run time after `last_run_unix` in the local time zone.
pub fn next_run(rule: &RecurrenceRule, last_run_unix: i64) -> NextRun {
    next_run_in(rule, last_run_unix, &Local)
}

pub(crate) fn next_run_in<Tz: TimeZone>(
    rule: &RecurrenceRule,
    last_run_unix: i64,
    tz: &Tz,
) -> NextRun {
    match rule.unit {
        IntervalUnit::Once => {
            if last_run_unix == 0 {
                NextRun::At(Utc::now().timestamp())
            } else {
                NextRun::Stopped
            }
        }
        IntervalUnit::Seconds => NextRun::At(last_run_unix + rule.value),
        IntervalUnit::Minutes => NextRun::At(last_run_unix + rule.value * 60),
        IntervalUnit::Hours => NextRun::At(last_run_unix + rule.value * 3600),
        IntervalUnit::Days
        | IntervalUnit::Weeks
        | IntervalUnit::Months
        | IntervalUnit::Years => calendar_next(rule, last_run_unix, tz),
    }
}

fn calendar_next<Tz: TimeZone>(rule: &RecurrenceRule, last_run_unix: i64, tz: &Tz) -> NextRun {
    let Ok(value) = u64::try_from(rule.value) else {
        return NextRun::Stopped;
    };
    let Some(last_run) = tz.timestamp_opt(last_run_unix, 0).single() else {
        return NextRun::Stopped;
    };

    let date = last_run.date_naive();
    let date = match rule.unit {
        IntervalUnit::Days => date.checked_add_days(Days::new(value)),
        IntervalUnit::Weeks => date
            .checked_add_days(Days::new(7 * value))
            .and_then(|d| match rule.at_day {
                Some(at_day) => {
                    let shift = at_day as i64 - d.weekday().num_days_from_sunday() as i64;
                    d.checked_add_signed(chrono::Duration::days(shift))
                }
                None => Some(d),
            }),
        IntervalUnit::Months => date
            .checked_add_months(Months::new(value as u32))
            .and_then(|d| snap_day_of_month(d, rule.at_day)),
        IntervalUnit::Years => date
            .checked_add_months(Months::new(12 * value as u32))
            .and_then(|d| NaiveDate::from_ymd_opt(d.year(), 1, 1))
            .and_then(|january| snap_day_of_month(january, rule.at_day.or(Some(1)))),
        _ => unreachable!("calendar_next called with non-calendar unit"),
    };

    let Some(date) = date else {
        return NextRun::Stopped;
    };
    let Some(at_time) = date.and_hms_opt(rule.at_hour, rule.at_minute, rule.at_second) else {
        return NextRun::Stopped;
    };
    // earliest() picks the first valid wall-clock instant across DST gaps
    match tz.from_local_datetime(&at_time).earliest() {
        Some(t) => NextRun::At(t.timestamp()),
        None => NextRun::Stopped,
    }
}

/// Set the day-of-month by walking forward from the 1st, so a target day past
/// the end of the month rolls into the next month instead of clamping.
fn snap_day_of_month(date: NaiveDate, at_day: Option<u32>) -> Option<NaiveDate> {
    match at_day {
        Some(at_day) if at_day >= 1 => date
            .with_day(1)?
            .checked_add_days(Days::new(u64::from(at_day) - 1)),
        _ => Some(date),
    }
}
