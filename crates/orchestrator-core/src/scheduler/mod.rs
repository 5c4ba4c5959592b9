//! Scheduler: translates active Tasks into WorkItems at the right
//! instants (SPEC_FULL.md §4.3).
//!
//! State is an in-memory map from `task_id` to its next-fire timer,
//! rebuilt on boot (or on gaining leadership) from `load_active_tasks`
//! and mutated by [`ChangeMessage`]s and [`EventMessage`]s. Only the
//! elected leader materialises; non-leaders still track the trigger
//! table so a failover leader has no cold-start gap, but they never
//! call `insert_work_item`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::domain::{Task, TaskStatus};
use crate::recurrence::{next_after, Descriptor, RecurrenceError};
use crate::store::{StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),
}

/// Change notification from the API collaborator (SPEC_FULL.md §6).
/// Delivery is at-least-once; every handler below is idempotent under
/// duplicate delivery.
#[derive(Debug, Clone)]
pub enum ChangeMessage {
    Created(Uuid),
    Updated(Uuid),
    StatusChanged(Uuid, TaskStatus),
    RunNow(Uuid),
    Snooze(Uuid, i64),
}

/// An external event arriving on the event channel.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity used for the leader-election advisory lock.
    pub holder_id: String,
    pub leader_lease_duration: ChronoDuration,
    pub leader_renew_interval: StdDuration,
    /// How often the trigger table is scanned for due fires.
    pub tick_interval: StdDuration,
}

impl SchedulerConfig {
    pub fn new(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            leader_lease_duration: ChronoDuration::seconds(15),
            leader_renew_interval: StdDuration::from_secs(5),
            tick_interval: StdDuration::from_millis(250),
        }
    }
}

/// One task's live timer state.
struct Armed {
    task: Task,
    /// `None` for `event`/`condition` tasks, which are never timer-armed.
    descriptor: Option<Descriptor>,
    next_fire: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    triggers: StdMutex<HashMap<Uuid, Armed>>,
    is_leader: AtomicBool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TaskStore>, config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
            triggers: StdMutex::new(HashMap::new()),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    pub fn armed_task_count(&self) -> usize {
        self.triggers.lock().unwrap().len()
    }

    /// Rebuilds the full trigger table from `load_active_tasks`. Called
    /// on boot and whenever this process newly gains leadership.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<(), SchedulerError> {
        let tasks = self.store.load_active_tasks().await?;
        let mut armed = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let entry = self.arm(task);
            armed.insert(entry.task.id, entry);
        }
        *self.triggers.lock().unwrap() = armed;
        info!(count = self.armed_task_count(), "trigger table rebuilt");
        Ok(())
    }

    /// Computes the descriptor and next-fire instant for one task,
    /// without touching the store.
    fn arm(&self, task: Task) -> Armed {
        match task.schedule_kind {
            crate::domain::ScheduleKind::Event | crate::domain::ScheduleKind::Condition => {
                Armed {
                    task,
                    descriptor: None,
                    next_fire: None,
                }
            }
            kind => match Descriptor::parse(kind, &task.schedule_expr, &task.timezone) {
                Ok(descriptor) => {
                    let ref_instant = task.last_materialized_at.unwrap_or_else(|| self.clock.now());
                    let next_fire = next_after(&descriptor, ref_instant).unwrap_or(None);
                    Armed {
                        task,
                        descriptor: Some(descriptor),
                        next_fire,
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "task has an invalid schedule descriptor; leaving disarmed");
                    Armed {
                        task,
                        descriptor: None,
                        next_fire: None,
                    }
                }
            },
        }
    }

    /// Re-arms a single task from the store, e.g. after a
    /// created/updated/resumed notification.
    async fn rearm_one(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        match self.store.get_task(task_id).await {
            Ok(task) if task.is_active() => {
                let entry = self.arm(task);
                self.triggers.lock().unwrap().insert(task_id, entry);
            }
            Ok(_) => {
                self.triggers.lock().unwrap().remove(&task_id);
            }
            Err(StoreError::NotFound(_)) => {
                self.triggers.lock().unwrap().remove(&task_id);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Scans the trigger table for entries due at `now` and materialises
    /// each, per the per-tick algorithm in SPEC_FULL.md §4.3. Only the
    /// leader inserts WorkItems.
    #[instrument(skip(self))]
    pub async fn materialize_due(&self) -> Result<(), SchedulerError> {
        if !self.is_leader() {
            return Ok(());
        }
        let now = self.clock.now();
        let due: Vec<Uuid> = {
            let guard = self.triggers.lock().unwrap();
            guard
                .iter()
                .filter(|(_, armed)| armed.next_fire.is_some_and(|fire| fire <= now))
                .map(|(id, _)| *id)
                .collect()
        };
        for task_id in due {
            if let Err(e) = self.fire(task_id).await {
                error!(task_id = %task_id, error = %e, "failed to materialise task");
            }
        }
        Ok(())
    }

    /// Materialises one due task: inserts a WorkItem (unless suppressed
    /// by dedupe), records `last_materialized_at`, and re-arms the timer
    /// for the next occurrence (or marks the task exhausted).
    async fn fire(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        let (task, descriptor, fire_instant) = {
            let guard = self.triggers.lock().unwrap();
            let Some(armed) = guard.get(&task_id) else {
                return Ok(());
            };
            let Some(fire_instant) = armed.next_fire else {
                return Ok(());
            };
            (armed.task.clone(), armed.descriptor.clone(), fire_instant)
        };

        let suppressed = match (&task.dedupe_key, task.dedupe_window_seconds) {
            (Some(key), window) if window > 0 => {
                self.store
                    .has_recent_materialisation(
                        task_id,
                        key,
                        ChronoDuration::seconds(window as i64),
                        self.clock.now(),
                    )
                    .await?
            }
            _ => false,
        };

        if suppressed {
            debug!(task_id = %task_id, "materialisation suppressed by dedupe window");
        } else {
            self.store
                .insert_work_item(task_id, fire_instant, task.dedupe_key.as_deref())
                .await?;
            self.store.set_last_materialized(task_id, fire_instant).await?;
            debug!(task_id = %task_id, run_at = %fire_instant, "task materialised");
        }

        let next_fire = match &descriptor {
            Some(d) => next_after(d, fire_instant)?,
            None => None,
        };

        let mut guard = self.triggers.lock().unwrap();
        if let Some(armed) = guard.get_mut(&task_id) {
            armed.task.last_materialized_at = Some(fire_instant);
            armed.next_fire = next_fire;
            if next_fire.is_none() {
                info!(task_id = %task_id, "task schedule exhausted; no further occurrences");
            }
        }
        Ok(())
    }

    /// `run_now(task_id)`: inserts an immediate WorkItem regardless of
    /// the timer state.
    #[instrument(skip(self))]
    pub async fn run_now(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        self.store.insert_work_item(task_id, now, None).await?;
        info!(task_id = %task_id, "run_now materialised an immediate work item");
        Ok(())
    }

    /// `snooze(task_id, delta_seconds)`: shifts this task's next
    /// in-memory fire forward. Limitation: an already-materialised
    /// pending WorkItem's `run_at` is not retroactively moved — the
    /// store's public contract has no "update a queued WorkItem" op, so
    /// snooze only affects fires the Scheduler has not yet materialised.
    #[instrument(skip(self))]
    pub async fn snooze(&self, task_id: Uuid, delta_seconds: i64) -> Result<(), SchedulerError> {
        let mut guard = self.triggers.lock().unwrap();
        if let Some(armed) = guard.get_mut(&task_id) {
            if let Some(next_fire) = armed.next_fire {
                armed.next_fire = Some(next_fire + ChronoDuration::seconds(delta_seconds));
                info!(task_id = %task_id, delta_seconds, "task snoozed");
            }
        }
        Ok(())
    }

    /// `pause`: disarms the timer but leaves already-materialised
    /// WorkItems in place.
    #[instrument(skip(self))]
    pub async fn pause(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        self.store.set_task_status(task_id, TaskStatus::Paused).await?;
        self.triggers.lock().unwrap().remove(&task_id);
        info!(task_id = %task_id, "task paused");
        Ok(())
    }

    /// `resume`: re-arms the timer from the task's current state.
    #[instrument(skip(self))]
    pub async fn resume(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        self.store.set_task_status(task_id, TaskStatus::Active).await?;
        self.rearm_one(task_id).await?;
        info!(task_id = %task_id, "task resumed");
        Ok(())
    }

    /// `cancel`: disarms the timer and purges pending (unleased)
    /// WorkItems; TaskRuns are kept for history. A Worker Pool's
    /// cancel-poll loop observes the status change and drives the
    /// `CancellationHandle` of any lease still in flight for this task.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        self.store.set_task_status(task_id, TaskStatus::Canceled).await?;
        self.triggers.lock().unwrap().remove(&task_id);
        let purged = self.store.delete_pending_work_items_for_task(task_id).await?;
        info!(task_id = %task_id, purged, "task canceled");
        Ok(())
    }

    #[instrument(skip(self, msg))]
    pub async fn handle_change(&self, msg: ChangeMessage) -> Result<(), SchedulerError> {
        match msg {
            ChangeMessage::Created(id) | ChangeMessage::Updated(id) => self.rearm_one(id).await,
            ChangeMessage::StatusChanged(id, TaskStatus::Active) => self.rearm_one(id).await,
            ChangeMessage::StatusChanged(id, TaskStatus::Paused) => {
                self.triggers.lock().unwrap().remove(&id);
                Ok(())
            }
            ChangeMessage::StatusChanged(id, TaskStatus::Canceled) => {
                self.triggers.lock().unwrap().remove(&id);
                self.store.delete_pending_work_items_for_task(id).await?;
                Ok(())
            }
            ChangeMessage::RunNow(id) => self.run_now(id).await,
            ChangeMessage::Snooze(id, delta) => self.snooze(id, delta).await,
        }
    }

    /// Event path: looks up tasks with `schedule_kind = event` matching
    /// the topic and materialises one WorkItem per task, passed through
    /// to the Worker as `context.event` (SPEC_FULL.md §4.3, §6).
    #[instrument(skip(self, msg), fields(topic = %msg.topic))]
    pub async fn handle_event(&self, msg: EventMessage) -> Result<(), SchedulerError> {
        if !self.is_leader() {
            return Ok(());
        }
        let tasks = self.store.tasks_for_event_topic(&msg.topic).await?;
        let now = self.clock.now();
        for task in tasks {
            self.store.insert_work_item(task.id, now, None).await?;
            debug!(task_id = %task.id, topic = %msg.topic, "event materialised a work item");
        }
        Ok(())
    }

    /// Attempts to acquire leadership if unheld, or renews it if held.
    /// On newly gaining leadership, rebuilds the trigger table so a
    /// failover leader starts from a consistent view of active tasks.
    #[instrument(skip(self))]
    pub async fn tick_leadership(&self) {
        let now = self.clock.now();
        if self.is_leader() {
            match self
                .store
                .renew_leader_lease(&self.config.holder_id, now + self.config.leader_lease_duration)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!("lost scheduler leadership");
                    self.is_leader.store(false, Ordering::Relaxed);
                }
                Err(e) => error!(error = %e, "leader lease renewal failed"),
            }
        } else {
            match self
                .store
                .try_acquire_leader_lease(&self.config.holder_id, now, self.config.leader_lease_duration)
                .await
            {
                Ok(true) => {
                    info!("acquired scheduler leadership");
                    self.is_leader.store(true, Ordering::Relaxed);
                    if let Err(e) = self.rebuild().await {
                        error!(error = %e, "failed to rebuild trigger table after gaining leadership");
                    }
                }
                Ok(false) => {}
                Err(e) => error!(error = %e, "leader lease acquisition failed"),
            }
        }
    }

    /// Runs the cooperative single-threaded main loop: leader
    /// acquisition/renewal, the materialisation tick, and the change/event
    /// channels, until shutdown is signaled.
    pub async fn run(
        self: Arc<Self>,
        mut change_rx: mpsc::Receiver<ChangeMessage>,
        mut event_rx: mpsc::Receiver<EventMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.tick_leadership().await;
        let mut leader_ticker = tokio::time::interval(self.config.leader_renew_interval);
        let mut fire_ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = leader_ticker.tick() => {
                    self.tick_leadership().await;
                }
                _ = fire_ticker.tick() => {
                    if let Err(e) = self.materialize_due().await {
                        error!(error = %e, "materialisation tick failed");
                    }
                }
                Some(msg) = change_rx.recv() => {
                    if let Err(e) = self.handle_change(msg).await {
                        error!(error = %e, "failed to handle change notification");
                    }
                }
                Some(msg) = event_rx.recv() => {
                    if let Err(e) = self.handle_event(msg).await {
                        error!(error = %e, "failed to handle event");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackoffStrategy, ScheduleKind};
    use crate::store::InMemoryTaskStore;

    fn cron_task(expr: &str) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            title: "t".into(),
            description: String::new(),
            owner_agent_id: Uuid::now_v7(),
            schedule_kind: ScheduleKind::Cron,
            schedule_expr: expr.into(),
            timezone: "UTC".into(),
            payload: serde_json::json!({"params": {}, "pipeline": []}),
            status: TaskStatus::Active,
            priority: 5,
            dedupe_key: None,
            dedupe_window_seconds: 0,
            max_retries: 0,
            backoff_strategy: BackoffStrategy::default(),
            concurrency_key: None,
            last_materialized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn new_leader_scheduler(store: Arc<dyn TaskStore>) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler::new(store, SchedulerConfig::new("test-holder")));
        scheduler.tick_leadership().await;
        assert!(scheduler.is_leader());
        scheduler
    }

    #[tokio::test]
    async fn rebuild_arms_every_active_task() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = cron_task("* * * * *");
        store.create_task(task.clone()).await.unwrap();
        let scheduler = new_leader_scheduler(store).await;
        assert_eq!(scheduler.armed_task_count(), 1);
    }

    #[tokio::test]
    async fn run_now_inserts_an_immediate_work_item() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = cron_task("0 0 1 1 *");
        store.create_task(task.clone()).await.unwrap();
        let scheduler = new_leader_scheduler(store.clone()).await;

        scheduler.run_now(task.id).await.unwrap();
        let leased = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w1")
            .await
            .unwrap();
        assert!(leased.is_some());
    }

    #[tokio::test]
    async fn cancel_purges_pending_work_items() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = cron_task("0 0 1 1 *");
        store.create_task(task.clone()).await.unwrap();
        let scheduler = new_leader_scheduler(store.clone()).await;
        scheduler.run_now(task.id).await.unwrap();

        scheduler.cancel(task.id).await.unwrap();
        assert_eq!(scheduler.armed_task_count(), 0);
        let leased = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w1")
            .await
            .unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn dedupe_window_suppresses_a_second_materialisation() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let mut task = cron_task("* * * * *");
        task.dedupe_key = Some("nightly".into());
        task.dedupe_window_seconds = 3600;
        task.last_materialized_at = Some(Utc::now() - ChronoDuration::seconds(30));
        store.create_task(task.clone()).await.unwrap();

        let scheduler = new_leader_scheduler(store.clone()).await;
        // Force the in-memory timer to be due right now.
        {
            let mut guard = scheduler.triggers.lock().unwrap();
            guard.get_mut(&task.id).unwrap().next_fire = Some(Utc::now());
        }
        store
            .insert_work_item(task.id, Utc::now() - ChronoDuration::seconds(30), Some("nightly"))
            .await
            .unwrap();

        scheduler.materialize_due().await.unwrap();

        // Only the original pre-seeded work item should exist; dedupe must
        // have suppressed the Scheduler's own materialisation attempt.
        let first = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w1")
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w2")
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn non_leader_does_not_materialise() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = cron_task("0 0 1 1 *");
        store.create_task(task.clone()).await.unwrap();
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::new("holder"));
        {
            let mut guard = scheduler.triggers.lock().unwrap();
            guard.insert(
                task.id,
                Armed {
                    task: task.clone(),
                    descriptor: None,
                    next_fire: Some(Utc::now()),
                },
            );
        }
        assert!(!scheduler.is_leader());
        scheduler.materialize_due().await.unwrap();
        let leased = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w1")
            .await
            .unwrap();
        assert!(leased.is_none());
    }
}
