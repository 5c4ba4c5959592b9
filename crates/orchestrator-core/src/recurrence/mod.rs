//! Recurrence Engine: pure, side-effect-free computation of next firing
//! instants for the schedule descriptor kinds in SPEC_FULL.md §4.2.
//!
//! Nothing in this module performs I/O. It is safe to call from task
//! creation validation as well as from the Scheduler's tick loop.

mod cron;
mod once;
mod rrule_engine;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::domain::ScheduleKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("the 'condition' schedule kind is reserved and not implemented")]
    ConditionNotImplemented,

    #[error("descriptors of kind '{0:?}' are not scheduled by the recurrence engine")]
    NotScheduledByEngine(ScheduleKind),
}

/// A parsed schedule descriptor plus its interpretation timezone. Built
/// once via [`Descriptor::parse`] and reused across `next_after` calls.
#[derive(Debug, Clone)]
pub struct Descriptor {
    kind: ScheduleKind,
    expr: String,
    zone: Tz,
}

impl Descriptor {
    pub fn parse(
        kind: ScheduleKind,
        expr: &str,
        timezone: &str,
    ) -> Result<Self, RecurrenceError> {
        let zone: Tz = timezone
            .parse()
            .map_err(|_| RecurrenceError::UnknownTimezone(timezone.to_string()))?;
        match kind {
            ScheduleKind::Cron | ScheduleKind::Rrule | ScheduleKind::Once => Ok(Self {
                kind,
                expr: expr.to_string(),
                zone,
            }),
            ScheduleKind::Event | ScheduleKind::Condition => Ok(Self {
                kind,
                expr: expr.to_string(),
                zone,
            }),
        }
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }
}

/// Returns the smallest instant strictly greater than `ref_instant` at
/// which the descriptor fires, or `None` if it has no future
/// occurrence. `event`/`condition` descriptors are not scheduled here
/// (SPEC_FULL.md §4.2) and always return an error.
pub fn next_after(
    descriptor: &Descriptor,
    ref_instant: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    match descriptor.kind {
        ScheduleKind::Cron => cron::next_after(&descriptor.expr, descriptor.zone, ref_instant),
        ScheduleKind::Rrule => {
            rrule_engine::next_after(&descriptor.expr, descriptor.zone, ref_instant)
        }
        ScheduleKind::Once => once::next_after(&descriptor.expr, ref_instant),
        ScheduleKind::Event => Err(RecurrenceError::NotScheduledByEngine(ScheduleKind::Event)),
        ScheduleKind::Condition => Err(RecurrenceError::ConditionNotImplemented),
    }
}

/// Previews up to `n` future occurrences, in ascending order.
pub fn next_n_after(
    descriptor: &Descriptor,
    ref_instant: DateTime<Utc>,
    n: usize,
) -> Result<Vec<DateTime<Utc>>, RecurrenceError> {
    let mut out = Vec::with_capacity(n);
    let mut cursor = ref_instant;
    for _ in 0..n {
        match next_after(descriptor, cursor)? {
            Some(instant) => {
                out.push(instant);
                cursor = instant;
            }
            None => break,
        }
    }
    Ok(out)
}

/// Syntactic and logical validation of a descriptor, per SPEC_FULL.md
/// §4.2. Returns the list of rejection reasons; empty means valid.
pub fn validate(kind: ScheduleKind, expr: &str, timezone: &str) -> Vec<String> {
    let descriptor = match Descriptor::parse(kind, expr, timezone) {
        Ok(d) => d,
        Err(e) => return vec![e.to_string()],
    };

    if matches!(kind, ScheduleKind::Condition) {
        return vec![RecurrenceError::ConditionNotImplemented.to_string()];
    }
    if matches!(kind, ScheduleKind::Event) {
        return if expr.trim().is_empty() {
            vec!["event descriptor must name a non-empty topic".to_string()]
        } else {
            vec![]
        };
    }

    match kind {
        ScheduleKind::Cron => cron::validate(expr),
        ScheduleKind::Rrule => rrule_engine::validate(expr),
        ScheduleKind::Once => once::validate(expr),
        ScheduleKind::Event | ScheduleKind::Condition => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ok_implies_next_after_has_an_answer() {
        let descriptor = Descriptor::parse(ScheduleKind::Cron, "*/5 * * * *", "UTC").unwrap();
        assert!(validate(ScheduleKind::Cron, "*/5 * * * *", "UTC").is_empty());
        let result = next_after(&descriptor, Utc::now());
        assert!(matches!(result, Ok(Some(_))));
    }

    #[test]
    fn condition_is_always_rejected() {
        let reasons = validate(ScheduleKind::Condition, "anything", "UTC");
        assert!(!reasons.is_empty());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let reasons = validate(ScheduleKind::Cron, "0 0 * * *", "Not/AZone");
        assert!(!reasons.is_empty());
    }
}
