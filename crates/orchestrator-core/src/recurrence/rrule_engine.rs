//! iCalendar RRULE descriptors (SPEC_FULL.md §4.2), including the DST
//! and leap-day edge cases called out in §8:
//!
//! - spring-forward gaps: local times that never occur are skipped by
//!   the underlying timezone database, landing on the next legal
//!   instant;
//! - fall-back overlaps: the earlier of the two legal instants is
//!   chosen, matching `chrono_tz`'s `LocalResult::Ambiguous` handling;
//! - `FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=29` only produces occurrences in
//!   leap years;
//! - `BYMONTHDAY=31` silently produces no occurrence in short months.
//!
//! None of these are handled by bespoke logic here; they fall out of
//! building the rule on top of a real `chrono_tz::Tz` and letting the
//! `rrule` crate enumerate candidate local datetimes against it.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use super::RecurrenceError;

/// Generous but finite horizon for enumerating occurrences. RRULE
/// descriptors are user-authored and may be unbounded (no COUNT or
/// UNTIL); this keeps a single `next_after` call from scanning forever
/// for a rule that, in practice, never fires again.
const MAX_CANDIDATES: u16 = 2_000;

fn build_rule_set(expr: &str, zone: Tz, dtstart: DateTime<Utc>) -> Result<RRuleSet, RecurrenceError> {
    let local = dtstart.with_timezone(&zone);
    let ical = format!(
        "DTSTART;TZID={}:{}\nRRULE:{}",
        zone.name(),
        local.format("%Y%m%dT%H%M%S"),
        expr.trim()
    );
    ical.parse::<RRuleSet>()
        .map_err(|e| RecurrenceError::InvalidDescriptor(format!("rrule: {e}")))
}

pub fn next_after(
    expr: &str,
    zone: Tz,
    ref_instant: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    let rule_set = build_rule_set(expr, zone, ref_instant)?;
    let result = rule_set.all(MAX_CANDIDATES);
    let next = result
        .dates
        .into_iter()
        .map(|dt| dt.with_timezone(&Utc))
        .find(|dt| *dt > ref_instant);
    Ok(next)
}

pub fn validate(expr: &str) -> Vec<String> {
    let rule_set = match build_rule_set(expr, chrono_tz::UTC, Utc::now()) {
        Ok(r) => r,
        Err(e) => return vec![e.to_string()],
    };
    let result = rule_set.all(1);
    if result.dates.is_empty() && !result.limited {
        return vec!["rrule descriptor never produces an occurrence".to_string()];
    }
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_rule_advances_by_one_day() {
        let ref_instant = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next = next_after("FREQ=DAILY", chrono_tz::UTC, ref_instant)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn leap_day_rule_only_fires_in_leap_years() {
        let ref_instant = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        let next = next_after(
            "FREQ=YEARLY;BYMONTH=2;BYMONTHDAY=29",
            chrono_tz::UTC,
            ref_instant,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.format("%Y-%m-%d").to_string(), "2028-02-29");
    }

    #[test]
    fn spring_forward_gap_lands_on_next_legal_instant() {
        // America/New_York: 2024-03-10 jumps from 02:00 to 03:00 local.
        let zone: Tz = "America/New_York".parse().unwrap();
        let ref_instant = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let next = next_after("FREQ=DAILY;BYHOUR=2;BYMINUTE=30;BYSECOND=0", zone, ref_instant)
            .unwrap()
            .unwrap();
        let local = next.with_timezone(&zone);
        assert_ne!((local.naive_local().format("%Y-%m-%d %H:%M").to_string()), "2024-03-10 02:30");
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(!validate("FREQ=NOT_A_FREQUENCY").is_empty());
    }
}
