//! Persisted row types for the scheduler database.

/// A built-in maintenance task definition. System tasks run on a plain
/// fixed interval in seconds; attempt/success timestamps are keyed by name.
#[derive(Debug, Clone)]
pub struct SystemTaskRow {
    pub name: String,
    pub log_name: String,
    pub active: bool,
    /// Only schedulable when the node runs the embedded database variant.
    pub embedded_only: bool,
    pub interval_secs: i64,
    /// Unix seconds of the last attempted run; 0 = never run.
    pub last_attempt_at: i64,
    /// Unix seconds of the last successful run; 0 = never succeeded.
    pub last_success_at: i64,
}

/// One schedule of a user-authored database routine. A routine may own
/// several rows; they are grouped into one task at rebuild time.
#[derive(Debug, Clone)]
pub struct RoutineScheduleRow {
    pub schedule_id: i64,
    pub routine_id: i64,
    pub routine_name: String,
    /// Interval unit in string form ("seconds".."years", "once"). Unknown
    /// values are tolerated and produce a schedule that never fires.
    pub interval_type: String,
    pub interval_value: i64,
    pub at_hour: i64,
    pub at_minute: i64,
    pub at_second: i64,
    pub at_day: Option<i64>,
    pub last_attempt_at: i64,
    pub last_success_at: i64,
}

/// A durable cluster event addressed to exactly one node. Rows are inserted
/// by any writer and consumed (read + deleted) by the owning node's poll
/// cycle; they are never retained after dispatch.
#[derive(Debug, Clone)]
pub struct ClusterEventRow {
    pub id: i64,
    pub target_node_id: i64,
    pub content_tag: String,
    /// JSON payload, shape depending on the tag.
    pub payload: String,
    pub created_at: i64,
}
