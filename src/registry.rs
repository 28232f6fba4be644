//! Wholesale rebuild of the in-memory task list from persisted definitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::recurrence::{IntervalUnit, NextRun, RecurrenceRule};
use crate::store::SchedulerStore;
use crate::tasks::{
    ScheduleState, SystemTaskCatalog, SystemTaskId, Task, TaskBody, SYSTEM_SCHEDULE_ID,
};

/// State shared between the scheduler loop, executions, and the registry.
///
/// `generation` is bumped on every rebuild; executions scheduled against an
/// older generation discard their results instead of writing back into a
/// list that no longer contains them. `wake` caches the earliest pending
/// run time so idle ticks skip the task scan.
pub struct SharedState {
    pub tasks: Vec<Task>,
    pub generation: u64,
    pub wake: Option<i64>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            generation: 0,
            wake: None,
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the task list from the store. The list is always replaced
/// wholesale, never patched in place.
pub struct TaskRegistry {
    store: Arc<dyn SchedulerStore>,
    catalog: SystemTaskCatalog,
    /// Whether this node runs the embedded database variant. Tasks flagged
    /// embedded-only are skipped otherwise.
    embedded_database: bool,
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        catalog: SystemTaskCatalog,
        embedded_database: bool,
    ) -> Self {
        Self {
            store,
            catalog,
            embedded_database,
        }
    }

    pub fn catalog(&self) -> &SystemTaskCatalog {
        &self.catalog
    }

    /// Rebuild the task list and swap it in under the lock.
    ///
    /// An unknown system task name or a system task without a registered
    /// body is a configuration defect and fails the whole rebuild. Unknown
    /// routine interval types are tolerated (a newer node may have written
    /// them) and yield schedules that never fire.
    pub fn rebuild(&self, shared: &Mutex<SharedState>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tasks = Vec::new();

        for row in self.store.list_system_tasks()? {
            if row.embedded_only && !self.embedded_database {
                continue;
            }
            let Some(id) = SystemTaskId::parse(&row.name) else {
                bail!("unknown system task '{}' in store", row.name);
            };
            if self.catalog.body(id).is_none() {
                bail!("no body registered for system task '{}'", id);
            }

            // A never-run task waits out one full interval from process
            // start; the bootstrap task instead fires immediately.
            let last_run_unix = if row.last_attempt_at == 0 && !id.is_bootstrap() {
                now
            } else {
                row.last_attempt_at
            };

            let mut task = Task {
                name: row.name,
                log_name: row.log_name,
                body: TaskBody::System(id),
                schedules: HashMap::from([(
                    SYSTEM_SCHEDULE_ID,
                    ScheduleState {
                        rule: Some(RecurrenceRule::every_seconds(row.interval_secs)),
                        last_run_unix,
                    },
                )]),
                running: false,
                next_run: NextRun::Stopped,
                next_schedule_id: SYSTEM_SCHEDULE_ID,
            };
            task.recompute_next_run();
            tasks.push(task);
        }

        // Routine schedules group by owning routine into one task each.
        let mut routine_index: HashMap<i64, usize> = HashMap::new();
        for row in self.store.list_routine_schedules()? {
            let rule = match IntervalUnit::parse(&row.interval_type) {
                Some(unit) => Some(RecurrenceRule {
                    unit,
                    value: row.interval_value,
                    at_hour: row.at_hour as u32,
                    at_minute: row.at_minute as u32,
                    at_second: row.at_second as u32,
                    at_day: row.at_day.map(|d| d as u32),
                }),
                None => {
                    warn!(
                        routine_id = row.routine_id,
                        schedule_id = row.schedule_id,
                        interval_type = %row.interval_type,
                        "unknown interval type, schedule will not fire"
                    );
                    None
                }
            };
            let state = ScheduleState {
                rule,
                last_run_unix: row.last_attempt_at,
            };

            match routine_index.get(&row.routine_id) {
                Some(&index) => {
                    tasks[index].schedules.insert(row.schedule_id, state);
                }
                None => {
                    routine_index.insert(row.routine_id, tasks.len());
                    tasks.push(Task {
                        name: format!("routine_{}", row.routine_id),
                        log_name: row.routine_name,
                        body: TaskBody::Routine {
                            routine_id: row.routine_id,
                        },
                        schedules: HashMap::from([(row.schedule_id, state)]),
                        running: false,
                        next_run: NextRun::Stopped,
                        next_schedule_id: row.schedule_id,
                    });
                }
            }
        }
        for index in routine_index.values() {
            tasks[*index].recompute_next_run();
        }

        let mut state = shared.lock().unwrap();
        state.tasks = tasks;
        state.generation += 1;
        state.wake = None;
        info!(
            tasks = state.tasks.len(),
            generation = state.generation,
            "task registry rebuilt"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RoutineScheduleRow, SqliteSchedulerStore, SystemTaskRow};
    use tempfile::TempDir;

    fn create_store() -> (Arc<SqliteSchedulerStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store =
            Arc::new(SqliteSchedulerStore::new(temp_dir.path().join("scheduler.db")).unwrap());
        (store, temp_dir)
    }

    fn system_row(name: &str, interval_secs: i64) -> SystemTaskRow {
        SystemTaskRow {
            name: name.to_string(),
            log_name: name.replace('_', " "),
            active: true,
            embedded_only: false,
            interval_secs,
            last_attempt_at: 0,
            last_success_at: 0,
        }
    }

    fn routine_row(schedule_id: i64, routine_id: i64, interval_type: &str) -> RoutineScheduleRow {
        RoutineScheduleRow {
            schedule_id,
            routine_id,
            routine_name: format!("routine {}", routine_id),
            interval_type: interval_type.to_string(),
            interval_value: 60,
            at_hour: 0,
            at_minute: 0,
            at_second: 0,
            at_day: None,
            last_attempt_at: 1000,
            last_success_at: 0,
        }
    }

    fn catalog_with(ids: &[SystemTaskId]) -> SystemTaskCatalog {
        let mut catalog = SystemTaskCatalog::new();
        for id in ids {
            catalog.register(*id, || Ok(()));
        }
        catalog
    }

    #[test]
    fn test_rebuild_defers_fresh_tasks_but_not_bootstrap() {
        let (store, _temp_dir) = create_store();
        store
            .upsert_system_task(&system_row("session_cleanup", 3600))
            .unwrap();
        store
            .upsert_system_task(&system_row("startup_checks", 3600))
            .unwrap();

        let registry = TaskRegistry::new(
            store,
            catalog_with(&[SystemTaskId::SessionCleanup, SystemTaskId::StartupChecks]),
            false,
        );
        let shared = Mutex::new(SharedState::new());
        registry.rebuild(&shared).unwrap();

        let now = chrono::Utc::now().timestamp();
        let state = shared.lock().unwrap();
        assert_eq!(state.tasks.len(), 2);
        for task in &state.tasks {
            match &task.next_run {
                NextRun::At(at) if task.name == "startup_checks" => {
                    // last_run 0 + interval, far in the past.
                    assert!(*at <= 3600, "bootstrap must be immediately due");
                }
                NextRun::At(at) => {
                    assert!(*at >= now + 3590, "fresh task must wait out one interval");
                }
                NextRun::Stopped => panic!("system tasks must have a next run"),
            }
        }
    }

    #[test]
    fn test_rebuild_preserves_recorded_last_attempt() {
        let (store, _temp_dir) = create_store();
        let mut row = system_row("session_cleanup", 600);
        row.last_attempt_at = 5000;
        store.upsert_system_task(&row).unwrap();

        let registry = TaskRegistry::new(
            store,
            catalog_with(&[SystemTaskId::SessionCleanup]),
            false,
        );
        let shared = Mutex::new(SharedState::new());
        registry.rebuild(&shared).unwrap();

        let state = shared.lock().unwrap();
        assert_eq!(state.tasks[0].next_run, NextRun::At(5600));
    }

    #[test]
    fn test_rebuild_skips_embedded_only_on_external_node() {
        let (store, _temp_dir) = create_store();
        let mut row = system_row("directory_sync", 600);
        row.embedded_only = true;
        store.upsert_system_task(&row).unwrap();

        let catalog = catalog_with(&[SystemTaskId::DirectorySync]);
        let shared = Mutex::new(SharedState::new());

        let external = TaskRegistry::new(store.clone(), catalog.clone(), false);
        external.rebuild(&shared).unwrap();
        assert!(shared.lock().unwrap().tasks.is_empty());

        let embedded = TaskRegistry::new(store, catalog, true);
        embedded.rebuild(&shared).unwrap();
        assert_eq!(shared.lock().unwrap().tasks.len(), 1);
    }

    #[test]
    fn test_rebuild_fails_on_unknown_system_task_name() {
        let (store, _temp_dir) = create_store();
        store
            .upsert_system_task(&system_row("defrag_universe", 600))
            .unwrap();

        let registry = TaskRegistry::new(store, SystemTaskCatalog::new(), false);
        let shared = Mutex::new(SharedState::new());
        let result = registry.rebuild(&shared);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unknown system task"));
    }

    #[test]
    fn test_rebuild_fails_on_missing_body() {
        let (store, _temp_dir) = create_store();
        store
            .upsert_system_task(&system_row("license_check", 600))
            .unwrap();

        let registry = TaskRegistry::new(store, SystemTaskCatalog::new(), false);
        let shared = Mutex::new(SharedState::new());
        let result = registry.rebuild(&shared);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no body registered"));
    }

    #[test]
    fn test_rebuild_groups_routine_schedules_by_routine() {
        let (store, _temp_dir) = create_store();
        let id_a1 = store
            .insert_routine_schedule(&routine_row(0, 7, "seconds"))
            .unwrap();
        let id_a2 = store
            .insert_routine_schedule(&routine_row(0, 7, "hours"))
            .unwrap();
        store
            .insert_routine_schedule(&routine_row(0, 9, "seconds"))
            .unwrap();

        let registry = TaskRegistry::new(store, SystemTaskCatalog::new(), false);
        let shared = Mutex::new(SharedState::new());
        registry.rebuild(&shared).unwrap();

        let state = shared.lock().unwrap();
        assert_eq!(state.tasks.len(), 2);
        let task_a = state
            .tasks
            .iter()
            .find(|t| t.name == "routine_7")
            .expect("routine 7 task");
        assert_eq!(task_a.schedules.len(), 2);
        assert!(task_a.schedules.contains_key(&id_a1));
        assert!(task_a.schedules.contains_key(&id_a2));
        // 60 seconds beats 60 hours.
        assert_eq!(task_a.next_schedule_id, id_a1);
        assert_eq!(task_a.next_run, NextRun::At(1060));
    }

    #[test]
    fn test_rebuild_tolerates_unknown_interval_type() {
        let (store, _temp_dir) = create_store();
        let schedule_id = store
            .insert_routine_schedule(&routine_row(0, 7, "fortnights"))
            .unwrap();

        let registry = TaskRegistry::new(store, SystemTaskCatalog::new(), false);
        let shared = Mutex::new(SharedState::new());
        registry.rebuild(&shared).unwrap();

        let state = shared.lock().unwrap();
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].next_run, NextRun::Stopped);
        assert!(state.tasks[0].schedules.contains_key(&schedule_id));
    }

    #[test]
    fn test_rebuild_bumps_generation_and_clears_wake() {
        let (store, _temp_dir) = create_store();
        let registry = TaskRegistry::new(store, SystemTaskCatalog::new(), false);
        let shared = Mutex::new(SharedState::new());
        shared.lock().unwrap().wake = Some(12345);

        registry.rebuild(&shared).unwrap();
        registry.rebuild(&shared).unwrap();

        let state = shared.lock().unwrap();
        assert_eq!(state.generation, 2);
        assert!(state.wake.is_none());
    }
}
