use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use super::schema::SCHEDULER_VERSIONED_SCHEMAS;
use super::{ClusterEventRow, RoutineScheduleRow, SchedulerStore, SystemTaskRow};
use crate::sqlite_persistence::BASE_DB_VERSION;

pub struct SqliteSchedulerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSchedulerStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open scheduler database")?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        if is_new_db {
            info!("Creating new scheduler database at {:?}", path);
            SCHEDULER_VERSIONED_SCHEMAS.last().unwrap().create(&conn)?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;

            if db_version < 1 {
                anyhow::bail!(
                    "Scheduler database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let current_schema_version =
                SCHEDULER_VERSIONED_SCHEMAS.last().unwrap().version as i64;

            let version_index = SCHEDULER_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown scheduler database version {}", db_version))?;
            SCHEDULER_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!(
                        "Scheduler database schema validation failed for version {}",
                        db_version
                    )
                })?;

            if db_version < current_schema_version {
                info!(
                    "Migrating scheduler database from version {} to {}",
                    db_version, current_schema_version
                );
                Self::migrate(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest = from_version;
        for schema in SCHEDULER_VERSIONED_SCHEMAS.iter() {
            if schema.version > from_version {
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx).with_context(|| {
                        format!("Failed to run migration to version {}", schema.version)
                    })?;
                }
                latest = schema.version;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn row_to_system_task(row: &rusqlite::Row) -> rusqlite::Result<SystemTaskRow> {
        Ok(SystemTaskRow {
            name: row.get("name")?,
            log_name: row.get("log_name")?,
            active: row.get::<_, i64>("active")? != 0,
            embedded_only: row.get::<_, i64>("embedded_only")? != 0,
            interval_secs: row.get("interval_secs")?,
            last_attempt_at: row.get("last_attempt_at")?,
            last_success_at: row.get("last_success_at")?,
        })
    }

    fn row_to_routine_schedule(row: &rusqlite::Row) -> rusqlite::Result<RoutineScheduleRow> {
        Ok(RoutineScheduleRow {
            schedule_id: row.get("id")?,
            routine_id: row.get("routine_id")?,
            routine_name: row.get("routine_name")?,
            interval_type: row.get("interval_type")?,
            interval_value: row.get("interval_value")?,
            at_hour: row.get("at_hour")?,
            at_minute: row.get("at_minute")?,
            at_second: row.get("at_second")?,
            at_day: row.get("at_day")?,
            last_attempt_at: row.get("last_attempt_at")?,
            last_success_at: row.get("last_success_at")?,
        })
    }

    fn row_to_cluster_event(row: &rusqlite::Row) -> rusqlite::Result<ClusterEventRow> {
        Ok(ClusterEventRow {
            id: row.get("id")?,
            target_node_id: row.get("target_node_id")?,
            content_tag: row.get("content_tag")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl SchedulerStore for SqliteSchedulerStore {
    fn list_system_tasks(&self) -> Result<Vec<SystemTaskRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, log_name, active, embedded_only, interval_secs,
                    last_attempt_at, last_success_at
             FROM system_tasks WHERE active = 1 ORDER BY name",
        )?;

        let tasks = stmt
            .query_map([], Self::row_to_system_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(tasks)
    }

    fn upsert_system_task(&self, row: &SystemTaskRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO system_tasks
                 (name, log_name, active, embedded_only, interval_secs,
                  last_attempt_at, last_success_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                 log_name = ?2, active = ?3, embedded_only = ?4, interval_secs = ?5",
            params![
                row.name,
                row.log_name,
                row.active as i64,
                row.embedded_only as i64,
                row.interval_secs,
                row.last_attempt_at,
                row.last_success_at,
            ],
        )?;
        Ok(())
    }

    fn list_routine_schedules(&self) -> Result<Vec<RoutineScheduleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, routine_id, routine_name, interval_type, interval_value,
                    at_hour, at_minute, at_second, at_day, last_attempt_at, last_success_at
             FROM routine_schedules ORDER BY routine_id, id",
        )?;

        let schedules = stmt
            .query_map([], Self::row_to_routine_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(schedules)
    }

    fn insert_routine_schedule(&self, row: &RoutineScheduleRow) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO routine_schedules
                 (routine_id, routine_name, interval_type, interval_value,
                  at_hour, at_minute, at_second, at_day, last_attempt_at, last_success_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.routine_id,
                row.routine_name,
                row.interval_type,
                row.interval_value,
                row.at_hour,
                row.at_minute,
                row.at_second,
                row.at_day,
                row.last_attempt_at,
                row.last_success_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn delete_routine_schedule(&self, schedule_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM routine_schedules WHERE id = ?1",
            params![schedule_id],
        )?;
        Ok(deleted > 0)
    }

    fn record_system_attempt(&self, name: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE system_tasks SET last_attempt_at = ?1 WHERE name = ?2",
            params![at, name],
        )?;
        Ok(())
    }

    fn record_system_success(&self, name: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE system_tasks SET last_success_at = ?1 WHERE name = ?2",
            params![at, name],
        )?;
        Ok(())
    }

    fn record_schedule_attempt(&self, schedule_id: i64, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE routine_schedules SET last_attempt_at = ?1 WHERE id = ?2",
            params![at, schedule_id],
        )?;
        Ok(())
    }

    fn record_schedule_success(&self, schedule_id: i64, at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE routine_schedules SET last_success_at = ?1 WHERE id = ?2",
            params![at, schedule_id],
        )?;
        Ok(())
    }

    fn insert_cluster_event(
        &self,
        target_node_id: i64,
        content_tag: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cluster_events (target_node_id, content_tag, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target_node_id,
                content_tag,
                payload.to_string(),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn fetch_cluster_events(&self, node_id: i64) -> Result<Vec<ClusterEventRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, target_node_id, content_tag, payload, created_at
             FROM cluster_events WHERE target_node_id = ?1 ORDER BY id",
        )?;

        let events = stmt
            .query_map(params![node_id], Self::row_to_cluster_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(events)
    }

    fn delete_cluster_events_up_to(&self, node_id: i64, max_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM cluster_events WHERE target_node_id = ?1 AND id <= ?2",
            params![node_id, max_id],
        )?;
        Ok(deleted)
    }
}
