//! Clock module - Duration conversions and calendar-relative day counts

use chrono::{DateTime, Datelike, Local, Months, NaiveDate, Utc};

pub const MS_PER_MINUTE: u64 = 60_000;
pub const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;

/// Calendar period a repeating condition is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
}

pub fn ms_to_minutes(ms: u64) -> u64 {
    ms / MS_PER_MINUTE
}

/// Convert milliseconds to hours, optionally rounded to the nearest whole hour
pub fn ms_to_hours(ms: u64, round: bool) -> f64 {
    let hours = ms as f64 / MS_PER_HOUR as f64;
    if round {
        hours.round()
    } else {
        hours
    }
}

pub fn hours_to_ms(hours: u32) -> u64 {
    hours as u64 * MS_PER_HOUR
}

pub fn minutes_to_ms(minutes: u32) -> u64 {
    minutes as u64 * MS_PER_MINUTE
}

/// Local calendar date of a UTC instant
pub fn local_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Days left in the week after `date` (Monday-based, zero on Sunday)
pub fn remaining_days_in_week(date: NaiveDate) -> i64 {
    7 - date.weekday().number_from_monday() as i64
}

pub fn days_in_month(date: NaiveDate) -> i64 {
    date.with_day(1)
        .and_then(|first| {
            first
                .checked_add_months(Months::new(1))
                .map(|next| (next - first).num_days())
        })
        .unwrap_or(31)
}

/// Days left in the month after `date` (zero on the last day)
pub fn remaining_days_in_month(date: NaiveDate) -> i64 {
    days_in_month(date) - date.day() as i64
}

/// Days left, counting `today`, in the period that contained `started`.
///
/// A value `<= 0` means that period is over.
pub fn remaining_days_in_period(period: Period, started: NaiveDate, today: NaiveDate) -> i64 {
    let left_at_start = match period {
        Period::Week => remaining_days_in_week(started),
        Period::Month => remaining_days_in_month(started),
    };
    left_at_start - (today - started).num_days() + 1
}
