//! `once` descriptors: a single ISO-8601 instant that fires exactly one
//! time and never recurs.

use chrono::{DateTime, Utc};

use super::RecurrenceError;

fn parse_instant(expr: &str) -> Result<DateTime<Utc>, RecurrenceError> {
    DateTime::parse_from_rfc3339(expr.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecurrenceError::InvalidDescriptor(format!("once: {e}")))
}

pub fn next_after(
    expr: &str,
    ref_instant: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    let fire_at = parse_instant(expr)?;
    Ok(if fire_at > ref_instant {
        Some(fire_at)
    } else {
        None
    })
}

pub fn validate(expr: &str) -> Vec<String> {
    match parse_instant(expr) {
        Ok(_) => vec![],
        Err(e) => vec![e.to_string()],
    }
}
