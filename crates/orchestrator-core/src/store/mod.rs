//! Durable store abstraction.
//!
//! [`TaskStore`] is the single source of truth contract described in
//! SPEC_FULL.md §4.1: task/agent persistence, the atomic work-item
//! leasing primitive, the append-only run and audit logs, and the
//! advisory lock backing Scheduler leader election. Two implementations
//! ship: [`InMemoryTaskStore`] for tests and local development, and
//! [`PostgresTaskStore`] for production.

mod error;
mod memory;
mod postgres;

pub use error::StoreError;
pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{Agent, AuditEntry, RunOutcome, Task, TaskRun, TaskStatus, WorkItem};

/// The durable store contract consumed by the Scheduler and Worker Pool.
///
/// Implementors MUST ensure `lease_ready_work` never returns the same
/// row to two concurrent callers, per the eligibility predicate and
/// ordering in SPEC_FULL.md §4.1.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_agent(&self, agent: Agent) -> Result<Agent, StoreError>;
    async fn get_agent(&self, id: Uuid) -> Result<Agent, StoreError>;

    async fn create_task(&self, task: Task) -> Result<Task, StoreError>;
    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError>;
    async fn update_task(&self, task: Task) -> Result<Task, StoreError>;
    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError>;
    async fn set_last_materialized(
        &self,
        id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// All tasks with `status = active`; used by the Scheduler on boot
    /// and on change notifications (SPEC_FULL.md §4.3).
    async fn load_active_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Active tasks whose `schedule_kind = event` and `schedule_expr`
    /// matches the given topic (SPEC_FULL.md §4.3 event path).
    async fn tasks_for_event_topic(&self, topic: &str) -> Result<Vec<Task>, StoreError>;

    /// Idempotent with respect to `(task_id, run_at)` when `dedupe_hint`
    /// is `Some`.
    async fn insert_work_item(
        &self,
        task_id: Uuid,
        run_at: DateTime<Utc>,
        dedupe_hint: Option<&str>,
    ) -> Result<WorkItem, StoreError>;

    /// Atomically leases at most one eligible WorkItem, ordered
    /// `(run_at asc, priority desc, id asc)`.
    async fn lease_ready_work(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
        worker_id: &str,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Succeeds iff `worker_id` still holds the lease on `work_item_id`.
    async fn renew_lease(
        &self,
        work_item_id: i64,
        worker_id: &str,
        new_until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Succeeds iff `worker_id` holds the lease; removes the row.
    async fn delete_work_item(&self, work_item_id: i64, worker_id: &str) -> Result<(), StoreError>;

    /// Clears `locked_until`/`locked_by` on every row whose lease has
    /// expired, returning the number of rows reclaimed. The eligibility
    /// predicate already treats an expired lease as immediately
    /// leaseable, so this is a defensive sweep rather than a
    /// correctness requirement — it lets the Worker Pool's stale-work
    /// reclaim loop (SPEC_FULL.md §4.4) observe and log recovered rows
    /// instead of relying purely on the passive check.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Removes all not-currently-leased WorkItems for a task (used by
    /// cancel/purge).
    async fn delete_pending_work_items_for_task(&self, task_id: Uuid) -> Result<u64, StoreError>;

    /// Whether a pending WorkItem or a TaskRun within `window` already
    /// exists for `(task_id, dedupe_key)` — backs the Scheduler's dedupe
    /// suppression (SPEC_FULL.md §4.3).
    async fn has_recent_materialisation(
        &self,
        task_id: Uuid,
        dedupe_key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn insert_run(&self, run: TaskRun) -> Result<TaskRun, StoreError>;

    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        error: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn last_run_for_task(&self, task_id: Uuid) -> Result<Option<TaskRun>, StoreError>;

    /// The highest-attempt `TaskRun` already recorded for `work_item_id`,
    /// if any — used to resume the attempt counter across a re-lease
    /// rather than restarting it at 1 (SPEC_FULL.md §3, §7).
    async fn latest_run_for_work_item(
        &self,
        work_item_id: i64,
    ) -> Result<Option<TaskRun>, StoreError>;

    async fn publish_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Acquires the single-row Scheduler leader lease if unheld or
    /// expired. Returns whether `holder_id` is now (or remains) leader.
    async fn try_acquire_leader_lease(
        &self,
        holder_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Renews the leader lease; returns `false` if another holder has
    /// since taken it.
    async fn renew_leader_lease(
        &self,
        holder_id: &str,
        new_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
