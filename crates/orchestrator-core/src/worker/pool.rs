//! Worker Pool: the lease/execute main loop plus its two background
//! loops (lease-renewal sweep, stale-work reclaim), per SPEC_FULL.md
//! §4.4.
//!
//! A single [`WorkerPool`] runs any number of concurrent in-flight
//! pipeline executions, bounded by `max_concurrency` and gated by
//! [`BackpressureState`] hysteresis. It never persists worker liveness
//! as a store entity — SPEC_FULL.md's data model has no Worker row —
//! so "heartbeat" here means renewing the leases this process already
//! holds, not registering with a worker registry.
//!
//! Event-triggered pipeline execution (`context.event`) is out of this
//! module's scope: `WorkItem` carries no event payload column, so a
//! deployment that wires event ingestion through to a specific
//! execution does so by a side channel outside this core. Pipelines
//! here always execute with `event = None`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancellation::CancellationHandle;
use crate::clock::{Clock, SystemClock};
use crate::domain::{RunOutcome, Task, TaskRun, TaskStatus, WorkItem};
use crate::pipeline::{ExecutorError, Pipeline, PipelineExecutor, ToolContextHints};
use crate::retry::RetryPolicy;
use crate::store::{StoreError, TaskStore};

use super::backpressure::{BackpressureConfig, BackpressureState};

/// Worker Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub max_concurrency: usize,
    pub backpressure: BackpressureConfig,

    /// Lease duration requested on each `lease_ready_work` call. Should be
    /// at least twice the expected median pipeline runtime (default 60s).
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Floor of the adaptive poll-backoff range used when the queue is
    /// repeatedly empty.
    #[serde(with = "duration_millis")]
    pub poll_interval_min: Duration,

    /// Ceiling of the adaptive poll-backoff range.
    #[serde(with = "duration_millis")]
    pub poll_interval_max: Duration,

    /// How often the lease-renewal sweep checks in-flight leases against
    /// their safety-margin deadline.
    #[serde(with = "duration_millis")]
    pub lease_renew_interval: Duration,

    /// How often the stale-work reclaim loop runs.
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// How often in-flight tasks are re-checked for a `canceled` status,
    /// driving the cancellation handle of any matching lease so the
    /// executor observes it at its next step boundary (SPEC_FULL.md §5(c)).
    #[serde(with = "duration_millis")]
    pub cancel_poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            lease_duration: Duration::from_secs(60),
            poll_interval_min: Duration::from_millis(100),
            poll_interval_max: Duration::from_millis(500),
            lease_renew_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            cancel_poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Sets the poll-backoff floor, raising the ceiling alongside it if
    /// the floor would otherwise exceed it.
    pub fn with_poll_interval_min(mut self, duration: Duration) -> Self {
        self.poll_interval_min = duration;
        if self.poll_interval_max < self.poll_interval_min {
            self.poll_interval_max = self.poll_interval_min;
        }
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// The renewal safety margin: 25% of the lease, per SPEC_FULL.md §4.4.
    pub fn safety_margin(&self) -> ChronoDuration {
        ChronoDuration::milliseconds((self.lease_duration.as_millis() / 4) as i64)
    }

    pub fn lease_duration_chrono(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.lease_duration.as_millis() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Bookkeeping for one in-flight lease, consulted by the renewal sweep
/// and the cancellation-poll sweep.
struct InFlightLease {
    task_id: Uuid,
    locked_until: DateTime<Utc>,
    cancellation: CancellationHandle,
    /// Set by the renewal sweep when it gives up on this lease so the
    /// attempt loop can distinguish `abandoned` (lease lost) from a
    /// cancellation requested for some other reason.
    abandoned: Arc<AtomicBool>,
}

/// Runs the Worker main loop (lease → load task → attempt pipeline with
/// retries → delete work item) plus the lease-renewal and stale-reclaim
/// background loops.
pub struct WorkerPool {
    store: Arc<dyn TaskStore>,
    executor: Arc<PipelineExecutor>,
    clock: Arc<dyn Clock>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: StdRwLock<WorkerPoolStatus>,
    active_permits: Arc<Semaphore>,
    in_flight: Arc<StdMutex<HashMap<i64, InFlightLease>>>,
    active_concurrency_keys: Arc<StdMutex<HashSet<String>>>,
    poll_handle: StdMutex<Option<JoinHandle<()>>>,
    renew_handle: StdMutex<Option<JoinHandle<()>>>,
    reclaim_handle: StdMutex<Option<JoinHandle<()>>>,
    cancel_poll_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<PipelineExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self::with_clock(store, executor, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn TaskStore>,
        executor: Arc<PipelineExecutor>,
        config: WorkerPoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));
        Self {
            store,
            executor,
            clock,
            active_permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            backpressure,
            shutdown_tx,
            shutdown_rx,
            status: StdRwLock::new(WorkerPoolStatus::Stopped),
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            active_concurrency_keys: Arc::new(StdMutex::new(HashSet::new())),
            poll_handle: StdMutex::new(None),
            renew_handle: StdMutex::new(None),
            reclaim_handle: StdMutex::new(None),
            cancel_poll_handle: StdMutex::new(None),
        }
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        if self.status() == WorkerPoolStatus::Running {
            return Err(WorkerPoolError::AlreadyRunning);
        }
        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );
        *self.status.write().unwrap() = WorkerPoolStatus::Running;
        self.start_poll_loop();
        self.start_renew_loop();
        self.start_reclaim_loop();
        self.start_cancel_poll_loop();
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if self.status() == WorkerPoolStatus::Stopped {
            return Ok(());
        }
        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_permits.available_permits();
            if available == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.max_concurrency - available,
                    "shutdown timeout reached with work still in flight"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for handle in [
            &self.poll_handle,
            &self.renew_handle,
            &self.reclaim_handle,
            &self.cancel_poll_handle,
        ] {
            if let Some(h) = handle.lock().unwrap().take() {
                h.abort();
            }
        }

        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    fn start_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let backpressure = Arc::clone(&self.backpressure);
        let permits = Arc::clone(&self.active_permits);
        let in_flight = Arc::clone(&self.in_flight);
        let active_keys = Arc::clone(&self.active_concurrency_keys);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut empty_polls: u32 = 0;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if !backpressure.should_accept() {
                    if wait_or_shutdown(config.poll_interval_min, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }

                let now = clock.now();
                match store
                    .lease_ready_work(now, config.lease_duration_chrono(), &config.worker_id)
                    .await
                {
                    Ok(Some(item)) => {
                        empty_polls = 0;
                        let permit = match Arc::clone(&permits).try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => {
                                // Backpressure should have prevented this; put
                                // the lease's fate in the renewal sweep's
                                // hands by simply not touching it further.
                                debug!("no semaphore permit available despite backpressure check");
                                continue;
                            }
                        };
                        backpressure.task_started();

                        let store = Arc::clone(&store);
                        let executor = Arc::clone(&executor);
                        let clock = Arc::clone(&clock);
                        let config = config.clone();
                        let backpressure = Arc::clone(&backpressure);
                        let in_flight = Arc::clone(&in_flight);
                        let active_keys = Arc::clone(&active_keys);

                        tokio::spawn(async move {
                            execute_leased_item(
                                item,
                                store,
                                executor,
                                clock,
                                config,
                                in_flight,
                                active_keys,
                            )
                            .await;
                            backpressure.task_completed();
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        empty_polls = empty_polls.saturating_add(1);
                        let backoff = adaptive_backoff(&config, empty_polls);
                        if wait_or_shutdown(backoff, &mut shutdown_rx).await {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "lease_ready_work failed");
                        if wait_or_shutdown(config.poll_interval_max, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
            }
            debug!("poll loop exited");
        });

        *self.poll_handle.lock().unwrap() = Some(handle);
    }

    fn start_renew_loop(&self) {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.lease_renew_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        renew_expiring_leases(&store, &*clock, &config, &in_flight).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("renew loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.renew_handle.lock().unwrap() = Some(handle);
    }

    fn start_reclaim_loop(&self) {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let interval = self.config.stale_reclaim_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_expired_leases(clock.now()).await {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "reclaimed stale work item leases"),
                            Err(e) => error!(error = %e, "stale-lease reclaim failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.reclaim_handle.lock().unwrap() = Some(handle);
    }

    /// Re-reads the task behind every in-flight lease on a fixed
    /// interval and drives that lease's `CancellationHandle` the moment
    /// the task's status is no longer `active` — the durable substitute
    /// for a dedicated cancel signal (SPEC_FULL.md §5(c), §9). The
    /// executor already polls the handle at each step boundary, so this
    /// loop only needs to flip it; `classify_outcome` reports the result
    /// as `Canceled` rather than `Abandoned` since the lease itself is
    /// still held.
    fn start_cancel_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let interval = self.config.cancel_poll_interval;
        let in_flight = Arc::clone(&self.in_flight);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poll_canceled_tasks(&store, &in_flight).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("cancel-poll loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.cancel_poll_handle.lock().unwrap() = Some(handle);
    }
}

/// Sleeps for `duration` unless shutdown is signaled first; returns
/// whether shutdown fired.
async fn wait_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown_rx.changed() => true,
    }
}

/// Linear ramp from `poll_interval_min` to `poll_interval_max` over the
/// first ten consecutive empty polls, then holds at the ceiling.
fn adaptive_backoff(config: &WorkerPoolConfig, empty_polls: u32) -> Duration {
    const RAMP_STEPS: u32 = 10;
    let min = config.poll_interval_min.as_millis() as u64;
    let max = config.poll_interval_max.as_millis() as u64;
    if max <= min {
        return config.poll_interval_min;
    }
    let step = empty_polls.min(RAMP_STEPS) as u64;
    let delta = (max - min) * step / RAMP_STEPS as u64;
    Duration::from_millis(min + delta)
}

#[instrument(skip(store, executor, clock, config, in_flight, active_keys), fields(work_item_id = item.id, task_id = %item.task_id))]
async fn execute_leased_item(
    item: WorkItem,
    store: Arc<dyn TaskStore>,
    executor: Arc<PipelineExecutor>,
    clock: Arc<dyn Clock>,
    config: WorkerPoolConfig,
    in_flight: Arc<StdMutex<HashMap<i64, InFlightLease>>>,
    active_keys: Arc<StdMutex<HashSet<String>>>,
) {
    let task = match store.get_task(item.task_id).await {
        Ok(task) => task,
        Err(e) => {
            warn!(error = %e, "failed to load task for leased work item; deleting item");
            let _ = store.delete_work_item(item.id, &config.worker_id).await;
            return;
        }
    };

    if task.status != TaskStatus::Active {
        debug!(status = ?task.status, "task no longer active; discarding work item");
        let _ = store.delete_work_item(item.id, &config.worker_id).await;
        return;
    }

    let held_key = acquire_concurrency_slot(&task, &active_keys, item.locked_until, &clock).await;

    run_attempts(&item, &task, &store, &executor, &clock, &config, &in_flight).await;

    let _ = store.delete_work_item(item.id, &config.worker_id).await;

    if let Some(key) = held_key {
        active_keys.lock().unwrap().remove(&key);
    }
}

/// Approximates SPEC_FULL.md §5's same-`concurrency_key` serialisation
/// via an in-process advisory set: waits (bounded by the item's current
/// lease) for any other in-flight execution sharing the key to finish.
async fn acquire_concurrency_slot(
    task: &Task,
    active_keys: &Arc<StdMutex<HashSet<String>>>,
    locked_until: Option<DateTime<Utc>>,
    clock: &Arc<dyn Clock>,
) -> Option<String> {
    let key = task.concurrency_key.clone()?;
    loop {
        {
            let mut guard = active_keys.lock().unwrap();
            if !guard.contains(&key) {
                guard.insert(key.clone());
                return Some(key);
            }
        }
        if let Some(until) = locked_until {
            if clock.now() >= until {
                // Lease about to expire anyway; proceed rather than risk
                // an indefinite wait and a lost lease.
                return None;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn run_attempts(
    item: &WorkItem,
    task: &Task,
    store: &Arc<dyn TaskStore>,
    executor: &Arc<PipelineExecutor>,
    clock: &Arc<dyn Clock>,
    config: &WorkerPoolConfig,
    in_flight: &Arc<StdMutex<HashMap<i64, InFlightLease>>>,
) {
    let policy = RetryPolicy::from_max_retries(task.max_retries);
    let pipeline: Pipeline = match serde_json::from_value(task.payload.clone()) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "task payload is not a valid pipeline document");
            return;
        }
    };

    let mut attempt: u32 = match store.latest_run_for_work_item(item.id).await {
        Ok(Some(previous)) => previous.attempt + 1,
        Ok(None) => 1,
        Err(e) => {
            warn!(error = %e, "failed to look up prior attempts for work item; starting at 1");
            1
        }
    };
    loop {
        let run = TaskRun::starting(task.id, item.id, attempt, config.worker_id.clone());
        if let Err(e) = store.insert_run(run.clone()).await {
            error!(error = %e, "failed to record run start");
            return;
        }

        let cancellation = CancellationHandle::new();
        let abandoned = Arc::new(AtomicBool::new(false));
        in_flight.lock().unwrap().insert(
            item.id,
            InFlightLease {
                task_id: task.id,
                locked_until: item.locked_until.unwrap_or_else(|| clock.now()),
                cancellation: cancellation.clone(),
                abandoned: Arc::clone(&abandoned),
            },
        );

        let hints = ToolContextHints {
            task_id: task.id,
            run_id: run.id,
            attempt,
        };
        let result = executor
            .execute(&pipeline, None, clock.now(), hints, &cancellation)
            .await;

        in_flight.lock().unwrap().remove(&item.id);

        let finished_at = clock.now();
        match result {
            Ok(outcome) => {
                let _ = store
                    .finalize_run(
                        run.id,
                        RunOutcome::Succeeded,
                        finished_at,
                        None,
                        Some(outcome.output_document()),
                    )
                    .await;
                return;
            }
            Err(err) => {
                let outcome_kind = classify_outcome(&err, &abandoned);
                let _ = store
                    .finalize_run(run.id, outcome_kind, finished_at, Some(err.to_string()), None)
                    .await;

                if matches!(outcome_kind, RunOutcome::Abandoned | RunOutcome::Canceled) {
                    return;
                }
                if err.retryable() && policy.has_attempts_remaining(attempt) {
                    let delay = policy.delay_for_attempt(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return;
            }
        }
    }
}

fn classify_outcome(err: &ExecutorError, abandoned: &AtomicBool) -> RunOutcome {
    if abandoned.load(Ordering::Relaxed) {
        return RunOutcome::Abandoned;
    }
    match err {
        ExecutorError::Canceled => RunOutcome::Canceled,
        ExecutorError::Timeout(_) => RunOutcome::TimedOut,
        _ => RunOutcome::Failed,
    }
}

/// Renews every in-flight lease that is within its safety margin of
/// expiry; cancels execution for any lease the store no longer confirms,
/// marking it `abandoned` so the attempt loop finalizes accordingly
/// rather than retrying on a lease it no longer holds.
async fn renew_expiring_leases(
    store: &Arc<dyn TaskStore>,
    clock: &dyn Clock,
    config: &WorkerPoolConfig,
    in_flight: &Arc<StdMutex<HashMap<i64, InFlightLease>>>,
) {
    let now = clock.now();
    let margin = config.safety_margin();
    let due: Vec<i64> = {
        let guard = in_flight.lock().unwrap();
        guard
            .iter()
            .filter(|(_, lease)| lease.locked_until - margin <= now)
            .map(|(id, _)| *id)
            .collect()
    };

    for id in due {
        let new_until = now + config.lease_duration_chrono();
        match store.renew_lease(id, &config.worker_id, new_until).await {
            Ok(()) => {
                if let Some(lease) = in_flight.lock().unwrap().get_mut(&id) {
                    lease.locked_until = new_until;
                }
            }
            Err(e) => {
                warn!(work_item_id = id, error = %e, "lease renewal failed; abandoning run");
                if let Some(lease) = in_flight.lock().unwrap().get(&id) {
                    lease.abandoned.store(true, Ordering::Relaxed);
                    lease.cancellation.cancel();
                }
            }
        }
    }
}

/// Checks every distinct task behind an in-flight lease against the
/// store and cancels the matching lease(s) once the task's status has
/// moved away from `active` (set by `Scheduler::cancel`).
async fn poll_canceled_tasks(
    store: &Arc<dyn TaskStore>,
    in_flight: &Arc<StdMutex<HashMap<i64, InFlightLease>>>,
) {
    let task_ids: HashSet<Uuid> = {
        let guard = in_flight.lock().unwrap();
        guard.values().map(|lease| lease.task_id).collect()
    };

    for task_id in task_ids {
        match store.get_task(task_id).await {
            Ok(task) if task.status != TaskStatus::Active => {
                let guard = in_flight.lock().unwrap();
                for lease in guard.values().filter(|l| l.task_id == task_id) {
                    if !lease.cancellation.is_canceled() {
                        debug!(task_id = %task_id, "task no longer active; canceling in-flight run");
                    }
                    lease.cancellation.cancel();
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to re-read task status for cancellation poll");
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackoffStrategy, ScheduleKind};
    use crate::pipeline::InMemoryToolRegistry;
    use crate::store::InMemoryTaskStore;

    fn make_task(payload: serde_json::Value) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            title: "t".into(),
            description: String::new(),
            owner_agent_id: Uuid::now_v7(),
            schedule_kind: ScheduleKind::Once,
            schedule_expr: now.to_rfc3339(),
            timezone: "UTC".into(),
            payload,
            status: TaskStatus::Active,
            priority: 5,
            dedupe_key: None,
            dedupe_window_seconds: 0,
            max_retries: 2,
            backoff_strategy: BackoffStrategy::default(),
            concurrency_key: None,
            last_materialized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn default_config_builder_overrides_apply() {
        let config = WorkerPoolConfig::default()
            .with_worker_id("w1")
            .with_max_concurrency(3)
            .with_lease_duration(Duration::from_secs(40));
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.safety_margin(), ChronoDuration::milliseconds(10_000));
    }

    #[test]
    fn adaptive_backoff_ramps_from_min_to_max() {
        let config = WorkerPoolConfig::default();
        assert_eq!(adaptive_backoff(&config, 0), config.poll_interval_min);
        assert_eq!(adaptive_backoff(&config, 100), config.poll_interval_max);
        let mid = adaptive_backoff(&config, 5);
        assert!(mid > config.poll_interval_min && mid < config.poll_interval_max);
    }

    #[tokio::test]
    async fn successful_pipeline_deletes_the_work_item_and_records_a_success() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = make_task(serde_json::json!({
            "params": {},
            "pipeline": [
                {"id": "s1", "uses": "echo", "with": {"msg": "hi"}, "save_as": "r"}
            ]
        }));
        store.create_task(task.clone()).await.unwrap();
        let item = store
            .insert_work_item(task.id, Utc::now(), None)
            .await
            .unwrap();
        let leased = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, item.id);

        let executor = Arc::new(PipelineExecutor::new(Arc::new(
            InMemoryToolRegistry::with_reference_tools(),
        )));
        let config = WorkerPoolConfig::default().with_worker_id("w1");
        let in_flight = Arc::new(StdMutex::new(HashMap::new()));
        let active_keys = Arc::new(StdMutex::new(HashSet::new()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        execute_leased_item(
            leased,
            Arc::clone(&store),
            executor,
            clock,
            config,
            in_flight,
            active_keys,
        )
        .await;

        let run = store.last_run_for_task(task.id).await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    }

    #[tokio::test]
    async fn inactive_task_discards_the_work_item_without_running_it() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let mut task = make_task(serde_json::json!({"params": {}, "pipeline": []}));
        task.status = TaskStatus::Paused;
        store.create_task(task.clone()).await.unwrap();
        let item = store
            .insert_work_item(task.id, Utc::now(), None)
            .await
            .unwrap();
        let leased = store
            .lease_ready_work(Utc::now(), ChronoDuration::seconds(60), "w1")
            .await
            .unwrap()
            .unwrap();

        let executor = Arc::new(PipelineExecutor::new(Arc::new(
            InMemoryToolRegistry::with_reference_tools(),
        )));
        let config = WorkerPoolConfig::default().with_worker_id("w1");
        execute_leased_item(
            leased,
            Arc::clone(&store),
            executor,
            Arc::new(SystemClock),
            config,
            Arc::new(StdMutex::new(HashMap::new())),
            Arc::new(StdMutex::new(HashSet::new())),
        )
        .await;

        assert!(store.last_run_for_task(task.id).await.unwrap().is_none());
        let _ = item;
    }

    #[tokio::test]
    async fn cancel_poll_drives_the_handle_of_a_canceled_tasks_lease() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let mut task = make_task(serde_json::json!({"params": {}, "pipeline": []}));
        task.status = TaskStatus::Active;
        store.create_task(task.clone()).await.unwrap();

        let cancellation = CancellationHandle::new();
        let in_flight = Arc::new(StdMutex::new(HashMap::new()));
        in_flight.lock().unwrap().insert(
            1,
            InFlightLease {
                task_id: task.id,
                locked_until: Utc::now(),
                cancellation: cancellation.clone(),
                abandoned: Arc::new(AtomicBool::new(false)),
            },
        );

        poll_canceled_tasks(&store, &in_flight).await;
        assert!(!cancellation.is_canceled(), "active task must not be canceled");

        store.set_task_status(task.id, TaskStatus::Canceled).await.unwrap();
        poll_canceled_tasks(&store, &in_flight).await;
        assert!(cancellation.is_canceled());
    }

    #[tokio::test]
    async fn re_lease_after_abandonment_resumes_the_attempt_counter() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = make_task(serde_json::json!({"params": {}, "pipeline": []}));
        store.create_task(task.clone()).await.unwrap();
        let item = store
            .insert_work_item(task.id, Utc::now(), None)
            .await
            .unwrap();

        let first = TaskRun::starting(task.id, item.id, 1, "w1");
        store.insert_run(first.clone()).await.unwrap();
        store
            .finalize_run(first.id, RunOutcome::Abandoned, Utc::now(), None, None)
            .await
            .unwrap();

        let resumed = store
            .latest_run_for_work_item(item.id)
            .await
            .unwrap()
            .expect("prior attempt recorded");
        assert_eq!(resumed.attempt, 1);

        let second_attempt = resumed.attempt + 1;
        assert_eq!(second_attempt, 2);
    }
}
