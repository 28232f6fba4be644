//! The scheduler loop and per-task execution path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{poll_task_body, EventDispatcher};
use crate::config::SchedulerConfig;
use crate::recurrence::NextRun;
use crate::registry::{SharedState, TaskRegistry};
use crate::store::{SchedulerStore, SystemTaskRow};
use crate::tasks::{RoutineRunner, SystemTaskCatalog, SystemTaskId, Task, TaskBody};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Reported by the manual trigger API. The loop's own overlapping launches
/// are silent no-ops; only an explicit trigger surfaces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerError {
    NotFound,
    AlreadyRunning,
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerError::NotFound => write!(f, "Task not found"),
            TriggerError::AlreadyRunning => write!(f, "Task is already running"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// Schedules and executes tasks against the shared task list.
///
/// One loop task ticks every second; each due task runs as an independent
/// spawned execution. Stale executions (scheduled before a registry rebuild)
/// discard their results instead of writing into the new list.
pub struct Scheduler {
    shared: Mutex<SharedState>,
    registry: TaskRegistry,
    store: Arc<dyn SchedulerStore>,
    runner: Arc<dyn RoutineRunner>,
    dispatcher: Arc<EventDispatcher>,
    shutdown: CancellationToken,
    startup_grace: Duration,
    cluster_poll_interval_secs: u64,
    running: AtomicBool,
    loop_spawned: AtomicBool,
}

impl Scheduler {
    /// The cluster poll body is registered here; all other system task
    /// bodies come from the host's catalog.
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn SchedulerStore>,
        mut catalog: SystemTaskCatalog,
        runner: Arc<dyn RoutineRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(shutdown.clone()));
        let poll_body = poll_task_body(
            Arc::clone(&store),
            config.node_id,
            Arc::clone(&dispatcher),
        );
        catalog.register(SystemTaskId::ClusterEventPoll, move || poll_body());

        let registry = TaskRegistry::new(Arc::clone(&store), catalog, config.embedded_database);

        Self {
            shared: Mutex::new(SharedState::new()),
            registry,
            store,
            runner,
            dispatcher,
            shutdown,
            startup_grace: config.startup_grace,
            cluster_poll_interval_secs: config.cluster_poll_interval_secs,
            running: AtomicBool::new(false),
            loop_spawned: AtomicBool::new(false),
        }
    }

    /// Hook point for the host to register cluster event handlers.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Seed the task list and start the loop. Idempotent: a second call
    /// while the loop is alive only re-seeds and rebuilds.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.seed_cluster_poll_task()?;
        self.registry.rebuild(&self.shared)?;
        self.running.store(true, Ordering::SeqCst);
        if self
            .loop_spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let scheduler = Arc::clone(self);
            tokio::spawn(scheduler.run_loop());
        }
        Ok(())
    }

    /// Insert or refresh the cluster poll task row with the configured
    /// cadence. The upsert preserves bookkeeping timestamps, so restarting
    /// never resets the poll history.
    fn seed_cluster_poll_task(&self) -> Result<()> {
        self.store.upsert_system_task(&SystemTaskRow {
            name: SystemTaskId::ClusterEventPoll.as_str().to_string(),
            log_name: "cluster event poll".to_string(),
            active: true,
            embedded_only: false,
            interval_secs: self.cluster_poll_interval_secs as i64,
            last_attempt_at: 0,
            last_success_at: 0,
        })
    }

    /// The loop exits on its next tick. Executions already in flight finish.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Re-read all task definitions from the store. Called by the host when
    /// the persisted schedule set changes (the schedules-changed cluster
    /// event handler does the same).
    pub fn reload(&self) -> Result<()> {
        self.registry.rebuild(&self.shared)
    }

    async fn run_loop(self: Arc<Self>) {
        // Warm-up delay so task bursts do not pile onto process startup.
        tokio::select! {
            _ = tokio::time::sleep(self.startup_grace) => {}
            _ = self.shutdown.cancelled() => {
                self.loop_spawned.store(false, Ordering::SeqCst);
                return;
            }
        }
        info!("scheduler loop started");

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    let now = chrono::Utc::now().timestamp();
                    for (index, generation) in self.collect_due(now) {
                        let scheduler = Arc::clone(&self);
                        tokio::spawn(async move {
                            scheduler.execute_task(index, generation).await;
                        });
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.loop_spawned.store(false, Ordering::SeqCst);
        info!("scheduler loop stopped");
    }

    /// Collect the indices of all due tasks, or refresh the cached wake time
    /// and return nothing when the earliest run is still in the future.
    fn collect_due(&self, now: i64) -> Vec<(usize, u64)> {
        let mut state = self.shared.lock().unwrap();
        if let Some(wake) = state.wake {
            if now < wake {
                return Vec::new();
            }
            state.wake = None;
        }

        let generation = state.generation;
        let mut due = Vec::new();
        let mut earliest: Option<i64> = None;
        for (index, task) in state.tasks.iter().enumerate() {
            if task.running {
                continue;
            }
            if let NextRun::At(at) = task.next_run {
                if at <= now {
                    due.push((index, generation));
                } else {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
            }
        }
        if due.is_empty() {
            state.wake = earliest;
        }
        due
    }

    /// Run one task to completion and fold the result back into the shared
    /// list. Returns false without running anything when the generation
    /// moved, the index no longer exists, or the task is already running.
    async fn execute_task(self: Arc<Self>, index: usize, scheduled_generation: u64) -> bool {
        let (mut task, schedule_id) = {
            let mut state = self.shared.lock().unwrap();
            if state.generation != scheduled_generation {
                return false;
            }
            let Some(task) = state.tasks.get_mut(index) else {
                return false;
            };
            if task.running {
                return false;
            }
            task.running = true;
            let schedule_id = task.next_schedule_id;
            (task.clone(), schedule_id)
        };

        self.record_attempt(&task, schedule_id, chrono::Utc::now().timestamp());

        let start_time = Instant::now();
        let result = self.run_body(&task).await;
        let elapsed = start_time.elapsed();
        let completed_at = chrono::Utc::now().timestamp();

        match result {
            Ok(()) => {
                info!(task = %task.log_name, ?elapsed, "task completed");
                self.record_success(&task, schedule_id, completed_at);
            }
            // A failed run is not retried; the next attempt is the next
            // natural recurrence.
            Err(e) => error!(task = %task.log_name, ?elapsed, "task failed: {:#}", e),
        }

        if let Some(schedule) = task.schedules.get_mut(&schedule_id) {
            schedule.last_run_unix = completed_at;
        }
        task.recompute_next_run();
        task.running = false;

        let mut state = self.shared.lock().unwrap();
        if state.generation != scheduled_generation {
            debug!(task = %task.log_name, "discarding result of stale execution");
            return true;
        }
        if let Some(slot) = state.tasks.get_mut(index) {
            *slot = task;
            // The new next run may be earlier than the cached wake time.
            state.wake = None;
        }
        true
    }

    async fn run_body(&self, task: &Task) -> Result<()> {
        match &task.body {
            TaskBody::System(id) => {
                let Some(body) = self.registry.catalog().body(*id) else {
                    anyhow::bail!("no body registered for system task '{}'", id);
                };
                tokio::task::spawn_blocking(move || body()).await?
            }
            TaskBody::Routine { routine_id } => {
                let runner = Arc::clone(&self.runner);
                let routine_id = *routine_id;
                tokio::task::spawn_blocking(move || runner.run(routine_id)).await?
            }
        }
    }

    fn record_attempt(&self, task: &Task, schedule_id: i64, at: i64) {
        let result = match &task.body {
            TaskBody::System(_) => self.store.record_system_attempt(&task.name, at),
            TaskBody::Routine { .. } => self.store.record_schedule_attempt(schedule_id, at),
        };
        if let Err(e) = result {
            warn!(task = %task.log_name, "failed to record attempt: {:#}", e);
        }
    }

    fn record_success(&self, task: &Task, schedule_id: i64, at: i64) {
        let result = match &task.body {
            TaskBody::System(_) => self.store.record_system_success(&task.name, at),
            TaskBody::Routine { .. } => self.store.record_schedule_success(schedule_id, at),
        };
        if let Err(e) = result {
            warn!(task = %task.log_name, "failed to record success: {:#}", e);
        }
    }

    /// Run a system task now, blocking until it completes.
    pub async fn trigger_system_task(
        self: &Arc<Self>,
        id: SystemTaskId,
    ) -> Result<(), TriggerError> {
        loop {
            let (index, generation) = {
                let state = self.shared.lock().unwrap();
                let index = state
                    .tasks
                    .iter()
                    .position(|t| t.name == id.as_str())
                    .ok_or(TriggerError::NotFound)?;
                if state.tasks[index].running {
                    return Err(TriggerError::AlreadyRunning);
                }
                (index, state.generation)
            };
            if Arc::clone(self).execute_task(index, generation).await {
                return Ok(());
            }
            // The registry was rebuilt (or the task started) between the
            // resolve and the execution; resolve again against the new list
            // rather than reporting success for a run that never happened.
        }
    }

    /// Run one specific schedule of a routine now, blocking until it
    /// completes. The schedule is force-selected regardless of which one
    /// would fire next.
    pub async fn trigger_routine_schedule(
        self: &Arc<Self>,
        routine_id: i64,
        schedule_id: i64,
    ) -> Result<(), TriggerError> {
        loop {
            let (index, generation) = {
                let mut state = self.shared.lock().unwrap();
                let index = state
                    .tasks
                    .iter()
                    .position(|t| matches!(t.body, TaskBody::Routine { routine_id: r } if r == routine_id))
                    .ok_or(TriggerError::NotFound)?;
                let task = &mut state.tasks[index];
                if !task.schedules.contains_key(&schedule_id) {
                    return Err(TriggerError::NotFound);
                }
                if task.running {
                    return Err(TriggerError::AlreadyRunning);
                }
                task.next_schedule_id = schedule_id;
                (index, state.generation)
            };
            if Arc::clone(self).execute_task(index, generation).await {
                return Ok(());
            }
        }
    }
}
