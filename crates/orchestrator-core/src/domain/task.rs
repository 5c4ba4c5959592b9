use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a task's firing instants are computed.
///
/// `Condition` is reserved vocabulary only: the source material names it
/// but never concretely defines it, so this implementation rejects it at
/// validation time rather than guessing its intent (SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Rrule,
    Once,
    Event,
    Condition,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Canceled,
}

/// Backoff strategy between failed attempts of the same task run.
///
/// `ExponentialJitter` is the default and the only strategy this core
/// ships (SPEC_FULL.md §7); the variant exists so a task's persisted
/// `backoff_strategy` column has somewhere to name future strategies
/// without a schema migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    ExponentialJitter,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialJitter
    }
}

/// A task definition: what to run (`payload`, a pipeline document), when
/// (`schedule_kind`/`schedule_expr`/`timezone`), and how failures are
/// handled (`max_retries`, `backoff_strategy`, `dedupe_*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub owner_agent_id: Uuid,
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: u8,
    pub dedupe_key: Option<String>,
    pub dedupe_window_seconds: u32,
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub concurrency_key: Option<String>,
    /// The instant of the last WorkItem this task materialised, used by
    /// the Scheduler to detect backward clock jumps (SPEC_FULL.md §4.3
    /// item 3). `None` until the task has fired at least once.
    pub last_materialized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// Priority clamped to the documented [1..9] invariant.
    pub fn clamped_priority(&self) -> u8 {
        self.priority.clamp(1, 9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            title: "nightly-report".into(),
            description: String::new(),
            owner_agent_id: Uuid::now_v7(),
            schedule_kind: ScheduleKind::Cron,
            schedule_expr: "0 2 * * *".into(),
            timezone: "UTC".into(),
            payload: serde_json::json!({"params": {}, "pipeline": []}),
            status: TaskStatus::Active,
            priority: 5,
            dedupe_key: None,
            dedupe_window_seconds: 0,
            max_retries: 3,
            backoff_strategy: BackoffStrategy::default(),
            concurrency_key: None,
            last_materialized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn is_active_reflects_status() {
        let mut task = sample_task();
        assert!(task.is_active());
        task.status = TaskStatus::Paused;
        assert!(!task.is_active());
    }

    #[test]
    fn priority_out_of_range_is_clamped() {
        let mut task = sample_task();
        task.priority = 0;
        assert_eq!(task.clamped_priority(), 1);
        task.priority = 200;
        assert_eq!(task.clamped_priority(), 9);
    }
}
