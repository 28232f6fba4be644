//! Task model: a named unit of work with one or more schedules, plus the
//! catalogs that bind task definitions to executable bodies.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::recurrence::{self, NextRun, RecurrenceRule};

/// System tasks own exactly one implicit schedule, stored under this id.
pub const SYSTEM_SCHEDULE_ID: i64 = 0;

/// Identifier of a built-in maintenance task. Persisted rows carry the
/// string form; anything that does not parse fails the registry rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemTaskId {
    ClusterEventPoll,
    SessionCleanup,
    TempFileCleanup,
    DirectorySync,
    LicenseCheck,
    StartupChecks,
}

impl SystemTaskId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemTaskId::ClusterEventPoll => "cluster_event_poll",
            SystemTaskId::SessionCleanup => "session_cleanup",
            SystemTaskId::TempFileCleanup => "temp_file_cleanup",
            SystemTaskId::DirectorySync => "directory_sync",
            SystemTaskId::LicenseCheck => "license_check",
            SystemTaskId::StartupChecks => "startup_checks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cluster_event_poll" => Some(SystemTaskId::ClusterEventPoll),
            "session_cleanup" => Some(SystemTaskId::SessionCleanup),
            "temp_file_cleanup" => Some(SystemTaskId::TempFileCleanup),
            "directory_sync" => Some(SystemTaskId::DirectorySync),
            "license_check" => Some(SystemTaskId::LicenseCheck),
            "startup_checks" => Some(SystemTaskId::StartupChecks),
            _ => None,
        }
    }

    /// The bootstrap task fires as soon as the scheduler starts on a fresh
    /// install instead of waiting out its first interval.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, SystemTaskId::StartupChecks)
    }
}

impl fmt::Display for SystemTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of a system task. Bodies are opaque to the scheduler: any error is a
/// task failure, logged and absorbed.
pub type SystemTaskBody = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Maps system task identifiers to the bodies the host registered for them.
#[derive(Clone, Default)]
pub struct SystemTaskCatalog {
    bodies: HashMap<SystemTaskId, SystemTaskBody>,
}

impl SystemTaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: SystemTaskId, body: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.bodies.insert(id, Arc::new(body));
    }

    pub fn body(&self, id: SystemTaskId) -> Option<SystemTaskBody> {
        self.bodies.get(&id).cloned()
    }
}

/// Runs a user-authored database routine by id.
///
/// Implementations must execute the routine inside a transaction, committing
/// on success and rolling back on error.
pub trait RoutineRunner: Send + Sync {
    fn run(&self, routine_id: i64) -> Result<()>;
}

/// One recurrence rule plus its own last-run bookkeeping.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    /// `None` marks an interval type this node does not understand (written
    /// by a newer node); such a schedule never fires.
    pub rule: Option<RecurrenceRule>,
    pub last_run_unix: i64,
}

impl ScheduleState {
    pub fn next_run(&self) -> NextRun {
        match &self.rule {
            Some(rule) => recurrence::next_run(rule, self.last_run_unix),
            None => NextRun::Stopped,
        }
    }
}

#[derive(Clone)]
pub enum TaskBody {
    System(SystemTaskId),
    Routine { routine_id: i64 },
}

/// A named recurring unit of work. A routine-backed task may own several
/// independent schedules; the earliest one wins.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub log_name: String,
    pub body: TaskBody,
    pub schedules: HashMap<i64, ScheduleState>,
    pub running: bool,
    pub next_run: NextRun,
    pub next_schedule_id: i64,
}

impl Task {
    pub fn is_system(&self) -> bool {
        matches!(self.body, TaskBody::System(_))
    }

    /// Recompute `next_run`/`next_schedule_id` as the earliest over all
    /// schedules. Exact ties follow map iteration order; the earliest time
    /// always dominates, only equal times are order-sensitive.
    pub fn recompute_next_run(&mut self) {
        let mut best: Option<(i64, NextRun)> = None;
        for (schedule_id, schedule) in &self.schedules {
            let candidate = schedule.next_run();
            match &best {
                None => best = Some((*schedule_id, candidate)),
                Some((_, incumbent)) if candidate.wins_over(incumbent) => {
                    best = Some((*schedule_id, candidate));
                }
                Some(_) => {}
            }
        }
        let (schedule_id, next_run) = best.unwrap_or((SYSTEM_SCHEDULE_ID, NextRun::Stopped));
        self.next_schedule_id = schedule_id;
        self.next_run = next_run;
    }
}
