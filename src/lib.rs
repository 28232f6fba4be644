//! Background job scheduling and cross-node coordination for a multi-tenant
//! application server.
//!
//! Task definitions live in a shared SQLite database: built-in maintenance
//! tasks on fixed intervals, plus calendar-based schedules of user-authored
//! database routines. One scheduler loop per node ticks every second and
//! runs each due task as an independent execution. Nodes coordinate through
//! a durable per-node event mailbox in the same database, polled by a
//! built-in task and dispatched to typed handlers.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod recurrence;
pub mod registry;
pub mod sqlite_persistence;
pub mod store;
pub mod tasks;

// Re-export commonly used types for convenience
pub use cluster::{ClusterEvent, ClusterEventKind, EventDispatcher};
pub use config::{ConfigOverrides, FileConfig, SchedulerConfig};
pub use engine::{Scheduler, TriggerError};
pub use recurrence::{IntervalUnit, NextRun, RecurrenceRule};
pub use store::{SchedulerStore, SqliteSchedulerStore};
pub use tasks::{RoutineRunner, SystemTaskCatalog, SystemTaskId};
