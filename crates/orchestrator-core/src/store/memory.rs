//! In-memory [`TaskStore`] implementation for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{StoreError, TaskStore};
use crate::domain::{Agent, AuditEntry, RunOutcome, Task, TaskRun, TaskStatus, WorkItem};

#[derive(Default)]
struct State {
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, Task>,
    work_items: HashMap<i64, WorkItem>,
    runs: HashMap<Uuid, TaskRun>,
    audit: Vec<AuditEntry>,
    leader: Option<(String, DateTime<Utc>)>,
}

/// Thread-safe, process-local store backed by `parking_lot::RwLock`.
///
/// Mirrors the teacher crate's `InMemoryWorkflowEventStore`: a single
/// lock around plain hash maps, good enough for tests and for small
/// single-process deployments but not for multi-process leasing (use
/// [`super::PostgresTaskStore`] for that).
pub struct InMemoryTaskStore {
    state: RwLock<State>,
    next_work_item_id: AtomicI64,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            next_work_item_id: AtomicI64::new(1),
        }
    }

    /// Number of rows currently in the work queue. Test-only helper.
    pub fn work_item_count(&self) -> usize {
        self.state.read().work_items.len()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_agent(&self, agent: Agent) -> Result<Agent, StoreError> {
        let mut state = self.state.write();
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: Uuid) -> Result<Agent, StoreError> {
        self.state
            .read()
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))
    }

    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut state = self.state.write();
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        self.state
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut state = self.state.write();
        if !state.tasks.contains_key(&task.id) {
            return Err(StoreError::NotFound(format!("task {}", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_last_materialized(
        &self,
        id: Uuid,
        instant: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        task.last_materialized_at = Some(instant);
        Ok(())
    }

    async fn load_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Active)
            .cloned()
            .collect())
    }

    async fn tasks_for_event_topic(&self, topic: &str) -> Result<Vec<Task>, StoreError> {
        use crate::domain::ScheduleKind;
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Active
                    && t.schedule_kind == ScheduleKind::Event
                    && t.schedule_expr == topic
            })
            .cloned()
            .collect())
    }

    async fn insert_work_item(
        &self,
        task_id: Uuid,
        run_at: DateTime<Utc>,
        dedupe_hint: Option<&str>,
    ) -> Result<WorkItem, StoreError> {
        let mut state = self.state.write();
        if dedupe_hint.is_some() {
            let existing = state
                .work_items
                .values()
                .find(|w| w.task_id == task_id && w.run_at == run_at);
            if let Some(existing) = existing {
                return Ok(existing.clone());
            }
        }
        let id = self.next_work_item_id.fetch_add(1, Ordering::SeqCst);
        let item = WorkItem {
            id,
            task_id,
            run_at,
            locked_until: None,
            locked_by: None,
            created_at: Utc::now(),
        };
        state.work_items.insert(id, item.clone());
        Ok(item)
    }

    async fn lease_ready_work(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
        worker_id: &str,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut state = self.state.write();
        let candidate_id = {
            let priority_of = |task_id: &Uuid| {
                state
                    .tasks
                    .get(task_id)
                    .map(|t| t.clamped_priority())
                    .unwrap_or(1)
            };
            let mut eligible: Vec<&WorkItem> = state
                .work_items
                .values()
                .filter(|w| w.is_eligible(now))
                .collect();
            eligible.sort_by(|a, b| {
                a.run_at
                    .cmp(&b.run_at)
                    .then_with(|| priority_of(&b.task_id).cmp(&priority_of(&a.task_id)))
                    .then_with(|| a.id.cmp(&b.id))
            });
            eligible.first().map(|w| w.id)
        };
        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let item = state.work_items.get_mut(&id).expect("candidate exists");
        item.locked_until = Some(now + lease_duration);
        item.locked_by = Some(worker_id.to_string());
        Ok(Some(item.clone()))
    }

    async fn renew_lease(
        &self,
        work_item_id: i64,
        worker_id: &str,
        new_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let item = state
            .work_items
            .get_mut(&work_item_id)
            .ok_or_else(|| StoreError::NotFound(format!("work item {work_item_id}")))?;
        if item.locked_by.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseNotHeld);
        }
        item.locked_until = Some(new_until);
        Ok(())
    }

    async fn delete_work_item(&self, work_item_id: i64, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.work_items.get(&work_item_id) {
            Some(item) if item.locked_by.as_deref() == Some(worker_id) => {
                state.work_items.remove(&work_item_id);
                Ok(())
            }
            Some(_) => Err(StoreError::LeaseNotHeld),
            None => Ok(()),
        }
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let mut reclaimed = 0u64;
        for item in state.work_items.values_mut() {
            if item.locked_by.is_some() && item.locked_until.is_some_and(|u| u < now) {
                item.locked_until = None;
                item.locked_by = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn delete_pending_work_items_for_task(&self, task_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let to_remove: Vec<i64> = state
            .work_items
            .values()
            .filter(|w| w.task_id == task_id && !w.locked_until.is_some_and(|u| u > now))
            .map(|w| w.id)
            .collect();
        let count = to_remove.len() as u64;
        for id in to_remove {
            state.work_items.remove(&id);
        }
        Ok(count)
    }

    async fn has_recent_materialisation(
        &self,
        task_id: Uuid,
        dedupe_key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let state = self.state.read();
        let pending = state.work_items.values().any(|w| w.task_id == task_id);
        if pending {
            return Ok(true);
        }
        let recent_run = state.runs.values().any(|r| {
            r.task_id == task_id && (now - r.started_at) <= window
        });
        let _ = dedupe_key; // dedupe scoping is per-task in this store; the
                            // key is persisted on the Task itself.
        Ok(recent_run)
    }

    async fn insert_run(&self, run: TaskRun) -> Result<TaskRun, StoreError> {
        let mut state = self.state.write();
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        error: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("task run {run_id}")))?;
        run.finished_at = Some(finished_at);
        run.outcome = Some(outcome);
        run.error = error;
        run.output = output;
        Ok(())
    }

    async fn last_run_for_task(&self, task_id: Uuid) -> Result<Option<TaskRun>, StoreError> {
        Ok(self
            .state
            .read()
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.attempt)
            .cloned())
    }

    async fn latest_run_for_work_item(
        &self,
        work_item_id: i64,
    ) -> Result<Option<TaskRun>, StoreError> {
        Ok(self
            .state
            .read()
            .runs
            .values()
            .filter(|r| r.work_item_id == work_item_id)
            .max_by_key(|r| r.attempt)
            .cloned())
    }

    async fn publish_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.state.write().audit.push(entry);
        Ok(())
    }

    async fn try_acquire_leader_lease(
        &self,
        holder_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        match &state.leader {
            Some((holder, until)) if holder == holder_id || *until > now => {
                if holder == holder_id {
                    state.leader = Some((holder_id.to_string(), now + lease_duration));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => {
                state.leader = Some((holder_id.to_string(), now + lease_duration));
                Ok(true)
            }
        }
    }

    async fn renew_leader_lease(
        &self,
        holder_id: &str,
        new_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        match &state.leader {
            Some((holder, _)) if holder == holder_id => {
                state.leader = Some((holder_id.to_string(), new_until));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryTaskStore {
        InMemoryTaskStore::new()
    }

    #[tokio::test]
    async fn lease_ready_work_returns_nothing_when_empty() {
        let store = store();
        let leased = store
            .lease_ready_work(Utc::now(), Duration::seconds(30), "w1")
            .await
            .unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn lease_then_second_lease_sees_nothing() {
        let store = store();
        let task_id = Uuid::now_v7();
        let now = Utc::now();
        store
            .insert_work_item(task_id, now - Duration::seconds(1), None)
            .await
            .unwrap();

        let first = store
            .lease_ready_work(now, Duration::seconds(30), "w1")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .lease_ready_work(now, Duration::seconds(30), "w2")
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn renew_lease_fails_for_wrong_owner() {
        let store = store();
        let task_id = Uuid::now_v7();
        let now = Utc::now();
        store
            .insert_work_item(task_id, now - Duration::seconds(1), None)
            .await
            .unwrap();
        let item = store
            .lease_ready_work(now, Duration::seconds(30), "w1")
            .await
            .unwrap()
            .unwrap();

        let err = store
            .renew_lease(item.id, "w2", now + Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotHeld));
    }

    #[tokio::test]
    async fn delete_work_item_requires_lease() {
        let store = store();
        let task_id = Uuid::now_v7();
        let now = Utc::now();
        store
            .insert_work_item(task_id, now - Duration::seconds(1), None)
            .await
            .unwrap();
        let item = store
            .lease_ready_work(now, Duration::seconds(30), "w1")
            .await
            .unwrap()
            .unwrap();

        assert!(store.delete_work_item(item.id, "w2").await.is_err());
        assert!(store.delete_work_item(item.id, "w1").await.is_ok());
        assert_eq!(store.work_item_count(), 0);
    }

    #[tokio::test]
    async fn leader_lease_is_exclusive_until_expiry() {
        let store = store();
        let now = Utc::now();
        assert!(store
            .try_acquire_leader_lease("a", now, Duration::seconds(10))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_leader_lease("b", now, Duration::seconds(10))
            .await
            .unwrap());
        // after expiry, a different holder may take over
        let later = now + Duration::seconds(11);
        assert!(store
            .try_acquire_leader_lease("b", later, Duration::seconds(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reclaim_clears_expired_locks_but_not_live_ones() {
        let store = store();
        let task_id = Uuid::now_v7();
        let now = Utc::now();
        store
            .insert_work_item(task_id, now - Duration::seconds(10), None)
            .await
            .unwrap();
        store
            .insert_work_item(task_id, now - Duration::seconds(10), None)
            .await
            .unwrap();
        store
            .lease_ready_work(now, Duration::seconds(5), "w1")
            .await
            .unwrap();
        store
            .lease_ready_work(now, Duration::seconds(600), "w2")
            .await
            .unwrap();

        let later = now + Duration::seconds(30);
        let reclaimed = store.reclaim_expired_leases(later).await.unwrap();
        assert_eq!(reclaimed, 1);
        let still_eligible = store.lease_ready_work(later, Duration::seconds(5), "w3").await.unwrap();
        assert!(still_eligible.is_some());
    }

    #[tokio::test]
    async fn concurrent_leasing_grants_each_item_once() {
        let store = std::sync::Arc::new(store());
        let now = Utc::now();
        for _ in 0..5 {
            store
                .insert_work_item(Uuid::now_v7(), now - Duration::seconds(1), None)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .lease_ready_work(now, Duration::seconds(30), &format!("w{i}"))
                    .await
                    .unwrap()
            }));
        }
        let mut leased = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                leased += 1;
            }
        }
        assert_eq!(leased, 5);
    }
}
