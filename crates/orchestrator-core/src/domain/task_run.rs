use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome of a finalized `TaskRun`.
///
/// Distinct from a plain success/failure boolean so the error taxonomy
/// of SPEC_FULL.md §7 survives into the append-only log: `Abandoned`
/// means the lease was lost, not that the pipeline itself failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Canceled,
    Abandoned,
}

impl RunOutcome {
    /// `success` column value: true only for `Succeeded`.
    pub fn success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One append-only execution log row for one attempt of one task.
///
/// `TaskRun`s are never event-sourced or replayed: each attempt is a
/// single terminal record written once, not a log of intermediate
/// events (SPEC_FULL.md §3 and §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    /// The `WorkItem` whose lease produced this attempt. Attempt numbers
    /// are contiguous per originating work item (SPEC_FULL.md §3, §7),
    /// so a re-lease after an `Abandoned` run must look this up to
    /// resume the counter rather than starting back at 1.
    pub work_item_id: i64,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
    pub lease_owner: String,
    pub created_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn starting(
        task_id: Uuid,
        work_item_id: i64,
        attempt: u32,
        lease_owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_id,
            work_item_id,
            attempt,
            started_at: now,
            finished_at: None,
            outcome: None,
            error: None,
            output: None,
            lease_owner: lease_owner.into(),
            created_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_run_is_not_finished() {
        let run = TaskRun::starting(Uuid::now_v7(), 1, 1, "worker-1");
        assert!(!run.is_finished());
        assert_eq!(run.attempt, 1);
    }

    #[test]
    fn only_succeeded_outcome_counts_as_success() {
        assert!(RunOutcome::Succeeded.success());
        assert!(!RunOutcome::Failed.success());
        assert!(!RunOutcome::Abandoned.success());
    }
}
