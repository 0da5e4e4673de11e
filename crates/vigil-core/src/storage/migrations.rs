//! Database schema migrations for vigil.
//!
//! Migrations are versioned and applied automatically when opening the
//! database. The `schema_version` table tracks the current version.

use rusqlite::{Connection, Result as SqliteResult};

/// Apply all pending migrations to bring the database to the current
/// schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Create the schema_version table if it doesn't exist.
fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or(0)
}

/// Migration v1: task snapshot cache, transition log, alert rules.
///
/// The transition log is append-only: rows are only ever inserted by
/// the reconciler or removed by the cascade when a task is deleted.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            status_label     TEXT NOT NULL DEFAULT '',
            status_class     TEXT NOT NULL DEFAULT 'pending',
            deep_link        TEXT,
            updated_at       TEXT,
            last_ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transitions (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id    TEXT NOT NULL,
            old_label  TEXT,
            new_label  TEXT NOT NULL,
            new_class  TEXT NOT NULL,
            changed_at TEXT NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS alert_rules (
            task_id        TEXT PRIMARY KEY,
            armed          INTEGER NOT NULL DEFAULT 0,
            destination    TEXT NOT NULL,
            threshold_secs INTEGER NOT NULL DEFAULT 0,
            last_fired_at  TEXT,
            updated_at     TEXT NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status_class ON tasks(status_class);
        CREATE INDEX IF NOT EXISTS idx_transitions_task_id ON transitions(task_id);
        CREATE INDEX IF NOT EXISTS idx_transitions_changed_at ON transitions(task_id, changed_at);
        CREATE INDEX IF NOT EXISTS idx_alert_rules_armed ON alert_rules(armed);",
    )?;

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [1])?;

    tx.commit()?;
    Ok(())
}

/// Migration v2: ingestion audit log.
///
/// Every push/poll ingestion attempt is recorded here so failed
/// ingestions can be inspected after the fact.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS webhook_log (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type   TEXT NOT NULL,
            task_id      TEXT,
            payload      TEXT NOT NULL,
            processed    INTEGER NOT NULL DEFAULT 0,
            error        TEXT,
            received_at  TEXT NOT NULL,
            processed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_webhook_log_event_type ON webhook_log(event_type);
        CREATE INDEX IF NOT EXISTS idx_webhook_log_processed ON webhook_log(processed);",
    )?;

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [2])?;

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_from_scratch() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 2);

        // All tables exist
        for table in ["tasks", "transitions", "alert_rules", "webhook_log"] {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 2);
    }

    #[test]
    fn incremental_migration_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema_version_table(&conn).unwrap();
        migrate_v1(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 1);

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 2);

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'webhook_log'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
