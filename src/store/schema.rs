//! SQLite schema definitions for the scheduler database.

use crate::sql_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - System tasks and routine schedules
// =============================================================================

/// Built-in maintenance task definitions.
const SYSTEM_TASKS_TABLE_V1: Table = Table {
    name: "system_tasks",
    columns: &[
        sql_column!("name", &SqlType::Text, is_primary_key = true),
        sql_column!("log_name", &SqlType::Text, non_null = true),
        sql_column!("active", &SqlType::Integer, non_null = true, default_value = Some("1")),
        sql_column!("embedded_only", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sql_column!("interval_secs", &SqlType::Integer, non_null = true),
        sql_column!("last_attempt_at", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sql_column!("last_success_at", &SqlType::Integer, non_null = true, default_value = Some("0")),
    ],
    indices: &[("idx_system_tasks_active", "active")],
};

/// Schedules of user-authored database routines, several rows per routine.
const ROUTINE_SCHEDULES_TABLE_V1: Table = Table {
    name: "routine_schedules",
    columns: &[
        sql_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sql_column!("routine_id", &SqlType::Integer, non_null = true),
        sql_column!("routine_name", &SqlType::Text, non_null = true),
        sql_column!("interval_type", &SqlType::Text, non_null = true),
        sql_column!("interval_value", &SqlType::Integer, non_null = true),
        sql_column!("at_hour", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sql_column!("at_minute", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sql_column!("at_second", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sql_column!("at_day", &SqlType::Integer),
        sql_column!("last_attempt_at", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sql_column!("last_success_at", &SqlType::Integer, non_null = true, default_value = Some("0")),
    ],
    indices: &[("idx_routine_schedules_routine", "routine_id")],
};

// =============================================================================
// Version 2 - Cluster event mailbox
// =============================================================================

/// Per-node durable mailbox replacing a message broker.
const CLUSTER_EVENTS_TABLE_V2: Table = Table {
    name: "cluster_events",
    columns: &[
        sql_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sql_column!("target_node_id", &SqlType::Integer, non_null = true),
        sql_column!("content_tag", &SqlType::Text, non_null = true),
        sql_column!("payload", &SqlType::Text, non_null = true),
        sql_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_cluster_events_target", "target_node_id, id")],
};

/// Migration from version 1 to version 2: add the cluster_events mailbox.
fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE cluster_events (
            id INTEGER PRIMARY KEY,
            target_node_id INTEGER NOT NULL,
            content_tag TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX idx_cluster_events_target ON cluster_events(target_node_id, id)",
        [],
    )?;
    Ok(())
}

pub const SCHEDULER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[SYSTEM_TASKS_TABLE_V1, ROUTINE_SCHEDULES_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            SYSTEM_TASKS_TABLE_V1,
            ROUTINE_SCHEDULES_TABLE_V1,
            CLUSTER_EVENTS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
