//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: event queue and failed-query cache
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id       TEXT NOT NULL,
        collection       TEXT NOT NULL,
        event_data       BLOB NOT NULL,
        pending          INTEGER NOT NULL DEFAULT 0,
        attempts         INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_collection ON events(project_id, collection, id);
    CREATE INDEX IF NOT EXISTS idx_events_pending ON events(project_id, pending);

    CREATE TABLE IF NOT EXISTS queries (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id       TEXT NOT NULL,
        query_type       TEXT NOT NULL,      -- 'count', 'funnel', 'multi_analysis', 'saved', 'dataset', ...
        query_name       TEXT,               -- saved/dataset name
        properties       JSON NOT NULL,
        query_key        TEXT NOT NULL,      -- sha256 over type, name and properties
        attempts         INTEGER NOT NULL DEFAULT 0,
        last_attempt_at  DATETIME NOT NULL,
        created_at       DATETIME NOT NULL,

        UNIQUE(project_id, query_key)
    );

    CREATE INDEX IF NOT EXISTS idx_queries_last_attempt ON queries(project_id, last_attempt_at);
    "#,
    // Version 2: key/value settings (legacy import flag)
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL,
        updated_at       DATETIME NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
