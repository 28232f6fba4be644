mod models;
mod schema;
mod sqlite_store;

pub use models::*;
pub use schema::SCHEDULER_VERSIONED_SCHEMAS;
pub use sqlite_store::SqliteSchedulerStore;

use anyhow::Result;

/// Persistence consumed by the scheduler core: task and schedule
/// definitions, attempt/success bookkeeping, and the cluster event mailbox.
pub trait SchedulerStore: Send + Sync {
    /// Active system task rows only.
    fn list_system_tasks(&self) -> Result<Vec<SystemTaskRow>>;
    /// Insert or replace a system task definition (installer/admin surface).
    fn upsert_system_task(&self, row: &SystemTaskRow) -> Result<()>;

    fn list_routine_schedules(&self) -> Result<Vec<RoutineScheduleRow>>;
    /// Returns the new schedule id.
    fn insert_routine_schedule(&self, row: &RoutineScheduleRow) -> Result<i64>;
    fn delete_routine_schedule(&self, schedule_id: i64) -> Result<bool>;

    // Bookkeeping timestamps, keyed by task name or schedule id.
    fn record_system_attempt(&self, name: &str, at: i64) -> Result<()>;
    fn record_system_success(&self, name: &str, at: i64) -> Result<()>;
    fn record_schedule_attempt(&self, schedule_id: i64, at: i64) -> Result<()>;
    fn record_schedule_success(&self, schedule_id: i64, at: i64) -> Result<()>;

    // Cluster event mailbox. The target node id partitions the table, so no
    // distributed lock is needed: only the owning node reads its own rows.
    fn insert_cluster_event(
        &self,
        target_node_id: i64,
        content_tag: &str,
        payload: &serde_json::Value,
    ) -> Result<i64>;
    fn fetch_cluster_events(&self, node_id: i64) -> Result<Vec<ClusterEventRow>>;
    /// Delete the fetched batch, bounded by the highest fetched row id so
    /// rows inserted mid-cycle survive to the next poll.
    fn delete_cluster_events_up_to(&self, node_id: i64, max_id: i64) -> Result<usize>;
}
