//! SQLite-backed persistence: task snapshot cache, append-only
//! transition log, alert rules, and the ingestion audit log.
//!
//! The connection sits behind a mutex so concurrent reconciliations
//! (push callback racing a polling refresh) serialize their appends.
//! An append is durable before the call returns; a storage failure is
//! surfaced to the caller, never swallowed.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{data_dir, migrations};
use crate::alert::{AlertRule, ArmedAlert};
use crate::error::{Result, StorageError};
use crate::status::StatusClass;
use crate::task::{TaskRecord, Transition};

/// Parse an RFC 3339 timestamp column, falling back to the epoch on
/// malformed data rather than failing the whole row.
fn parse_datetime(dt_str: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

fn parse_datetime_opt(dt_str: Option<String>) -> Option<DateTime<Utc>> {
    dt_str.as_deref().map(parse_datetime)
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
    let class_str: String = row.get(3)?;
    let updated_at: Option<String> = row.get(5)?;
    let last_ingested_at: String = row.get(6)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        status_label: row.get(2)?,
        status_class: StatusClass::parse(&class_str),
        deep_link: row.get(4)?,
        updated_at: parse_datetime_opt(updated_at),
        last_ingested_at: parse_datetime(&last_ingested_at),
    })
}

fn row_to_transition(row: &rusqlite::Row) -> rusqlite::Result<Transition> {
    let class_str: String = row.get(4)?;
    let changed_at: String = row.get(5)?;
    Ok(Transition {
        id: row.get(0)?,
        task_id: row.get(1)?,
        old_label: row.get(2)?,
        new_label: row.get(3)?,
        new_class: StatusClass::parse(&class_str),
        changed_at: parse_datetime(&changed_at),
    })
}

fn row_to_alert_rule(row: &rusqlite::Row) -> rusqlite::Result<AlertRule> {
    let threshold_secs: i64 = row.get(3)?;
    let last_fired_at: Option<String> = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(AlertRule {
        task_id: row.get(0)?,
        armed: row.get(1)?,
        destination: row.get(2)?,
        threshold_secs: threshold_secs.max(0) as u64,
        last_fired_at: parse_datetime_opt(last_fired_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn upsert_task_row(conn: &Connection, task: &TaskRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, name, status_label, status_class, deep_link, updated_at, last_ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            status_label = excluded.status_label,
            status_class = excluded.status_class,
            deep_link = excluded.deep_link,
            updated_at = excluded.updated_at,
            last_ingested_at = excluded.last_ingested_at",
        params![
            task.id,
            task.name,
            task.status_label,
            task.status_class.as_str(),
            task.deep_link,
            task.updated_at.map(|dt| dt.to_rfc3339()),
            task.last_ingested_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Append a transition unless the log's latest classification for the
/// task already equals `new_class`. Runs on the caller's transaction.
fn append_if_class_changed(
    conn: &Connection,
    task_id: &str,
    old_label: Option<&str>,
    new_label: &str,
    new_class: StatusClass,
    changed_at: DateTime<Utc>,
) -> rusqlite::Result<Option<i64>> {
    let last_class: Option<String> = conn
        .query_row(
            "SELECT new_class FROM transitions
             WHERE task_id = ?1
             ORDER BY changed_at DESC, id DESC
             LIMIT 1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;

    if last_class.as_deref() == Some(new_class.as_str()) {
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO transitions (task_id, old_label, new_label, new_class, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            task_id,
            old_label,
            new_label,
            new_class.as_str(),
            changed_at.to_rfc3339(),
        ],
    )?;
    Ok(Some(conn.last_insert_rowid()))
}

/// Per-event-type counters from the ingestion audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookStat {
    pub event_type: String,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
}

/// SQLite database for vigil state.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `~/.config/vigil/vigil.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self> {
        let path = data_dir()?.join("vigil.db");
        Ok(Self::open_at(&path)?)
    }

    /// Open the database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|source| StorageError::OpenFailed {
            path: PathBuf::from(path),
            source,
        })?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests, ephemeral runs).
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|source| StorageError::OpenFailed {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        // Cascading deletes from tasks require foreign keys on.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(StorageError::from)?;
        migrations::migrate(&conn)
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // === Task snapshot cache ===

    /// Insert or update the cached task record.
    pub fn upsert_task(&self, task: &TaskRecord) -> Result<(), StorageError> {
        upsert_task_row(&self.conn(), task)?;
        Ok(())
    }

    /// Get a cached task record by id.
    pub fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, status_label, status_class, deep_link, updated_at, last_ingested_at
             FROM tasks WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![task_id], row_to_task).optional()?)
    }

    /// All cached task records, most recently updated first.
    pub fn tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, status_label, status_class, deep_link, updated_at, last_ingested_at
             FROM tasks ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Tasks currently classified as tracked.
    pub fn tracked_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, status_label, status_class, deep_link, updated_at, last_ingested_at
             FROM tasks WHERE status_class = 'in_progress'",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Delete a task on explicit upstream deletion. Cascades to its
    /// transition log and alert rule.
    pub fn delete_task(&self, task_id: &str) -> Result<bool, StorageError> {
        let changed = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(changed > 0)
    }

    // === Transition log ===

    /// Append a transition record. Durable before return.
    pub fn record_transition(
        &self,
        task_id: &str,
        old_label: Option<&str>,
        new_label: &str,
        new_class: StatusClass,
        changed_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO transitions (task_id, old_label, new_label, new_class, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task_id,
                old_label,
                new_label,
                new_class.as_str(),
                changed_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a transition only if the log's latest classification for
    /// this task differs from `new_class`.
    ///
    /// The check and the insert run in one transaction, so two racing
    /// reconciliations cannot both conclude "no transition exists yet"
    /// and append duplicates.
    pub fn record_transition_if_changed(
        &self,
        task_id: &str,
        old_label: Option<&str>,
        new_label: &str,
        new_class: StatusClass,
        changed_at: DateTime<Utc>,
    ) -> Result<Option<i64>, StorageError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let id = append_if_class_changed(&tx, task_id, old_label, new_label, new_class, changed_at)?;
        tx.commit()?;
        Ok(id)
    }

    /// Upsert the task record and conditionally append the transition
    /// it implies, in one transaction.
    ///
    /// The append uses the same latest-classification check as
    /// [`Self::record_transition_if_changed`]. Atomicity is the point:
    /// if the append fails, the record upsert rolls back with it, so a
    /// retry still observes the pre-failure classification and
    /// re-attempts the append instead of concluding nothing changed.
    pub fn upsert_task_with_transition(
        &self,
        task: &TaskRecord,
        old_label: Option<&str>,
        changed_at: DateTime<Utc>,
    ) -> Result<Option<i64>, StorageError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        upsert_task_row(&tx, task)?;
        let id = append_if_class_changed(
            &tx,
            &task.id,
            old_label,
            &task.status_label,
            task.status_class,
            changed_at,
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Ordered transition log for a task: `(changed_at, id)` ascending.
    pub fn transition_history(&self, task_id: &str) -> Result<Vec<Transition>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, old_label, new_label, new_class, changed_at
             FROM transitions
             WHERE task_id = ?1
             ORDER BY changed_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_transition)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Whether the log holds any transition into the tracked state for
    /// this task. False means the cold-start backfill has not run.
    pub fn has_tracked_entry(&self, task_id: &str) -> Result<bool, StorageError> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM transitions WHERE task_id = ?1 AND new_class = 'in_progress'
             )",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // === Alert rules ===

    /// Create or update the alert rule for a task.
    pub fn upsert_alert_rule(
        &self,
        task_id: &str,
        armed: bool,
        destination: &str,
        threshold_hours: u32,
        threshold_minutes: u32,
    ) -> Result<(), StorageError> {
        let threshold_secs = AlertRule::threshold_from(threshold_hours, threshold_minutes) as i64;
        self.conn().execute(
            "INSERT INTO alert_rules (task_id, armed, destination, threshold_secs, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(task_id) DO UPDATE SET
                armed = excluded.armed,
                destination = excluded.destination,
                threshold_secs = excluded.threshold_secs,
                updated_at = excluded.updated_at",
            params![
                task_id,
                armed,
                destination,
                threshold_secs,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get the alert rule for a task.
    pub fn alert_rule(&self, task_id: &str) -> Result<Option<AlertRule>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, armed, destination, threshold_secs, last_fired_at, updated_at
             FROM alert_rules WHERE task_id = ?1",
        )?;
        Ok(stmt
            .query_row(params![task_id], row_to_alert_rule)
            .optional()?)
    }

    /// All armed rules joined with the current state of their task.
    pub fn armed_alerts(&self) -> Result<Vec<ArmedAlert>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.task_id, r.armed, r.destination, r.threshold_secs, r.last_fired_at,
                    r.updated_at, t.name, t.status_class, t.deep_link
             FROM alert_rules r
             JOIN tasks t ON r.task_id = t.id
             WHERE r.armed = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            let rule = row_to_alert_rule(row)?;
            let class_str: String = row.get(7)?;
            Ok(ArmedAlert {
                rule,
                task_name: row.get(6)?,
                task_status_class: StatusClass::parse(&class_str),
                deep_link: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Disarm a rule after a confirmed delivery. Compare-and-set: only
    /// an armed rule is changed, so a second concurrent disarm for the
    /// same cycle is a no-op returning false, not an error.
    pub fn disarm_alert(
        &self,
        task_id: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changed = self.conn().execute(
            "UPDATE alert_rules
             SET armed = 0, last_fired_at = ?2, updated_at = ?2
             WHERE task_id = ?1 AND armed = 1",
            params![task_id, fired_at.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    // === Ingestion audit log ===

    /// Record a received ingestion event before processing it.
    pub fn log_webhook(
        &self,
        event_type: &str,
        task_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<i64, StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO webhook_log (event_type, task_id, payload, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event_type,
                task_id,
                payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark an ingestion event processed, with the error if it failed.
    pub fn mark_webhook_processed(
        &self,
        webhook_id: i64,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        self.conn().execute(
            "UPDATE webhook_log
             SET processed = 1, processed_at = ?2, error = ?3
             WHERE id = ?1",
            params![webhook_id, Utc::now().to_rfc3339(), error],
        )?;
        Ok(())
    }

    /// Per-event-type ingestion counters.
    pub fn webhook_stats(&self) -> Result<Vec<WebhookStat>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_type,
                    COUNT(*),
                    SUM(CASE WHEN processed = 1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END)
             FROM webhook_log
             GROUP BY event_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WebhookStat {
                event_type: row.get(0)?,
                total: row.get(1)?,
                processed: row.get(2)?,
                errors: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
