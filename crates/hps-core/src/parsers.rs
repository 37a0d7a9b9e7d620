//! Lenient timestamp parsing and the canonical database timestamp format.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::errors::ParseTimestampError;

/// Format used when timestamps are written to the database.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parses a timestamp from any string containing `year[, month[, day[, hour[, minute[, second]]]]]`
/// digit groups separated by non-digit characters.
///
/// Missing components are filled with the latest value of the enclosing unit, so `"2015"`
/// becomes `2015-12-31 23:59:59` and `"2015-05"` becomes `2015-05-31 23:59:59`.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, ParseTimestampError> {
    let digits: Vec<i32> = input
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i32>().ok())
        .collect();
    if digits.is_empty() {
        return Err(ParseTimestampError::NoDigits(input.to_string()));
    }
    let year = digits[0];
    let month = u32::try_from(digits.get(1).copied().unwrap_or(12)).unwrap_or(0);
    let day = match digits.get(2) {
        Some(&day) => u32::try_from(day).unwrap_or(0),
        None => last_day_of_month(year, month),
    };
    let hour = u32::try_from(digits.get(3).copied().unwrap_or(23)).unwrap_or(99);
    let minute = u32::try_from(digits.get(4).copied().unwrap_or(59)).unwrap_or(99);
    let second = u32::try_from(digits.get(5).copied().unwrap_or(59)).unwrap_or(99);

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        ParseTimestampError::ChronoError(format!("invalid date: {year}-{month}-{day}"))
    })?;
    let time = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
        ParseTimestampError::ChronoError(format!("invalid time: {hour}:{minute}:{second}"))
    })?;
    let naive = NaiveDateTime::new(date, time);
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let Some(start) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return 0;
    };
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .unwrap_or(start);
    next_month.pred_opt().unwrap_or(start).day()
}

/// Formats a timestamp the way the conditions tables store it.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}
