//! Classical five-field cron descriptors ("minute hour dom month dow").
//!
//! The `cron` crate parses the conventional six-field form (seconds
//! first); this module prepends a fixed `0` seconds field so the
//! public descriptor syntax matches SPEC_FULL.md §4.2 ("seconds field
//! not supported").

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use super::RecurrenceError;

fn to_six_field(expr: &str) -> String {
    format!("0 {}", expr.trim())
}

fn parse_schedule(expr: &str) -> Result<Schedule, RecurrenceError> {
    Schedule::from_str(&to_six_field(expr))
        .map_err(|e| RecurrenceError::InvalidDescriptor(format!("cron: {e}")))
}

pub fn next_after(
    expr: &str,
    zone: Tz,
    ref_instant: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    let schedule = parse_schedule(expr)?;
    let local_ref = ref_instant.with_timezone(&zone);
    Ok(schedule.after(&local_ref).next().map(|dt| dt.with_timezone(&Utc)))
}

pub fn validate(expr: &str) -> Vec<String> {
    match parse_schedule(expr) {
        Ok(_) => vec![],
        Err(e) => vec![e.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_five_minutes_advances_correctly() {
        let ref_instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = next_after("*/5 * * * *", chrono_tz::UTC, ref_instant)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn malformed_field_count_is_rejected() {
        assert!(!validate("not a cron expression").is_empty());
    }

    #[test]
    fn month_end_skips_months_without_a_31st() {
        let ref_instant = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 1).unwrap();
        let next = next_after("0 0 31 * *", chrono_tz::UTC, ref_instant)
            .unwrap()
            .unwrap();
        // February and April lack a 31st; next hit is March 31st.
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap());
    }
}
