//! Durable event queue
//!
//! Every event row is either *committed* (waiting to be uploaded) or
//! *pending* (handed out by [`EventStore::get_events`] and not yet reconciled).
//! Pending rows are never returned twice, never evicted by the collection cap,
//! and leave the pending state only through [`EventStore::purge_pending_events`],
//! [`EventStore::reset_pending_events`] or an explicit delete.

use crate::config::Config;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::format_ts;

/// Row identifier assigned by the store on insert
pub type EventId = i64;

/// Bounds applied by the store on every add and every batch read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// How many events a collection may hold before the oldest are aged out
    pub max_events_per_collection: usize,
    /// How many events are dropped at once when aging out
    pub events_to_forget: usize,
    /// Times an event is handed out for upload before it is dropped
    pub max_event_upload_attempts: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_events_per_collection: 10_000,
            events_to_forget: 100,
            max_event_upload_attempts: 3,
        }
    }
}

impl StoreLimits {
    /// Limits taken from the `[storage]` and `[upload]` config sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_events_per_collection: config.storage.max_events_per_collection,
            events_to_forget: config.storage.events_to_forget,
            max_event_upload_attempts: config.upload.max_event_upload_attempts,
        }
    }
}

/// An event handed out for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    /// Collection the event was added to
    pub collection: String,
    /// Serialized event, byte-identical to what was added
    pub payload: Vec<u8>,
    /// Upload attempts already charged to the event
    pub attempts: u32,
}

/// Local event store for a single project
///
/// The connection sits behind a mutex that is held for the whole of each
/// operation, so pending-state transitions never interleave.
pub struct EventStore {
    conn: Mutex<Connection>,
    project_id: String,
    limits: StoreLimits,
}

impl EventStore {
    /// Open or create a store at the given path and bring its schema up to date
    pub fn open(path: &Path, project_id: &str, limits: StoreLimits) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        let store = Self::with_connection(conn, project_id, limits);
        store.migrate()?;
        tracing::debug!(path = %path.display(), project_id, "Opened event store");
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(project_id: &str, limits: StoreLimits) -> Result<Self> {
        let store = Self::with_connection(Connection::open_in_memory()?, project_id, limits);
        store.migrate()?;
        Ok(store)
    }

    fn with_connection(conn: Connection, project_id: &str, limits: StoreLimits) -> Self {
        Self {
            conn: Mutex::new(conn),
            project_id: project_id.to_string(),
            limits,
        }
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        super::schema::run_migrations(&conn)
    }

    /// Project this store belongs to
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Limits enforced by this store
    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind: uncommitted transactions roll back on drop.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Event operations
    // ============================================

    /// Add an event to the store
    ///
    /// Ages out the oldest non-pending events of the collection first when the
    /// collection is at its cap. Fails only when storage fails.
    pub fn add_event(&self, collection: &str, payload: &[u8]) -> Result<EventId> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM events WHERE project_id = ?1 AND collection = ?2",
            params![self.project_id, collection],
            |r| r.get(0),
        )?;

        let cap = self.limits.max_events_per_collection as i64;
        if count >= cap {
            let to_forget = (self.limits.events_to_forget as i64).max(count - cap + 1);
            let evicted = tx.execute(
                r#"
                DELETE FROM events WHERE id IN (
                    SELECT id FROM events
                    WHERE project_id = ?1 AND collection = ?2 AND pending = 0
                    ORDER BY id ASC
                    LIMIT ?3
                )
                "#,
                params![self.project_id, collection, to_forget],
            )?;

            if evicted == 0 {
                tracing::warn!(
                    collection,
                    count,
                    cap,
                    "Collection is at capacity but every event is pending; nothing evicted"
                );
            } else {
                tracing::info!(collection, evicted, cap, "Aged out oldest events");
            }
        }

        tx.execute(
            r#"
            INSERT INTO events (project_id, collection, event_data, pending, attempts, created_at)
            VALUES (?1, ?2, ?3, 0, 0, ?4)
            "#,
            params![self.project_id, collection, payload, format_ts(Utc::now())],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::trace!(id, collection, bytes = payload.len(), "Added event");
        Ok(id)
    }

    /// Get every event that is ready to send, keyed by id
    ///
    /// Returned events are flagged pending in the same transaction. Events
    /// that already used up their upload attempts are dropped first. On
    /// storage failure the error is logged and an empty map is returned.
    pub fn get_events(&self) -> BTreeMap<EventId, PendingEvent> {
        match self.try_get_events() {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch events for upload");
                BTreeMap::new()
            }
        }
    }

    fn try_get_events(&self) -> Result<BTreeMap<EventId, PendingEvent>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let dropped = tx.execute(
            "DELETE FROM events WHERE project_id = ?1 AND pending = 0 AND attempts >= ?2",
            params![self.project_id, self.limits.max_event_upload_attempts],
        )?;
        if dropped > 0 {
            tracing::warn!(
                dropped,
                max_attempts = self.limits.max_event_upload_attempts,
                "Dropped events that exhausted their upload attempts"
            );
        }

        let events = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, collection, event_data, attempts FROM events
                WHERE project_id = ?1 AND pending = 0
                ORDER BY id ASC
                "#,
            )?;
            let rows = stmt.query_map([&self.project_id], |row| {
                Ok((
                    row.get::<_, EventId>(0)?,
                    PendingEvent {
                        collection: row.get(1)?,
                        payload: row.get(2)?,
                        attempts: row.get(3)?,
                    },
                ))
            })?;
            rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?
        };

        tx.execute(
            "UPDATE events SET pending = 1 WHERE project_id = ?1 AND pending = 0",
            [&self.project_id],
        )?;
        tx.commit()?;

        tracing::debug!(count = events.len(), "Marked events pending");
        Ok(events)
    }

    /// Determine if there are any pending events
    pub fn has_pending_events(&self) -> bool {
        self.get_pending_event_count() > 0
    }

    /// Count pending events
    pub fn get_pending_event_count(&self) -> usize {
        self.count_where("project_id = ?1 AND pending = 1", params![self.project_id])
    }

    /// Count all events, pending or not
    pub fn get_total_event_count(&self) -> usize {
        self.count_where("project_id = ?1", params![self.project_id])
    }

    /// Count events in one collection, pending or not
    pub fn get_collection_event_count(&self, collection: &str) -> usize {
        self.count_where(
            "project_id = ?1 AND collection = ?2",
            params![self.project_id, collection],
        )
    }

    fn count_where(&self, predicate: &str, params: &[&dyn rusqlite::ToSql]) -> usize {
        let conn = self.conn();
        let sql = format!("SELECT COUNT(*) FROM events WHERE {}", predicate);
        match conn.query_row(&sql, params, |r| r.get::<_, i64>(0)) {
            Ok(count) => count as usize,
            Err(e) => {
                tracing::error!(error = %e, predicate, "Failed to count events");
                0
            }
        }
    }

    /// Delete every pending event (after a confirmed upload)
    pub fn purge_pending_events(&self) -> Result<usize> {
        let conn = self.conn();
        let purged = conn.execute(
            "DELETE FROM events WHERE project_id = ?1 AND pending = 1",
            [&self.project_id],
        )?;
        tracing::debug!(purged, "Purged pending events");
        Ok(purged)
    }

    /// Return every pending event to the committed state so it is sent again
    pub fn reset_pending_events(&self) -> Result<usize> {
        let conn = self.conn();
        let reset = conn.execute(
            "UPDATE events SET pending = 0 WHERE project_id = ?1 AND pending = 1",
            [&self.project_id],
        )?;
        tracing::debug!(reset, "Reset pending events");
        Ok(reset)
    }

    /// Count one more upload attempt against each of `ids`
    ///
    /// Called for events the API answered for without accepting them.
    /// Events that were never answered for keep their count.
    pub fn charge_upload_attempts(&self, ids: &[EventId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut charged = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE events SET attempts = attempts + 1 WHERE project_id = ?1 AND id = ?2",
            )?;
            for id in ids {
                charged += stmt.execute(params![self.project_id, id])?;
            }
        }
        tx.commit()?;
        Ok(charged)
    }

    /// Delete one event; returns whether it existed
    pub fn delete_event(&self, id: EventId) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM events WHERE project_id = ?1 AND id = ?2",
            params![self.project_id, id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete every event of the project
    pub fn delete_all_events(&self) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM events WHERE project_id = ?1", [&self.project_id])?;
        tracing::info!(deleted, "Deleted all events");
        Ok(deleted)
    }

    /// Keep the `offset` most recent non-pending events and delete older ones
    pub fn delete_events_from_offset(&self, offset: usize) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            r#"
            DELETE FROM events WHERE id IN (
                SELECT id FROM events
                WHERE project_id = ?1 AND pending = 0
                ORDER BY id DESC
                LIMIT -1 OFFSET ?2
            )
            "#,
            params![self.project_id, offset as i64],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, offset, "Deleted events beyond offset");
        }
        Ok(deleted)
    }

    // ============================================
    // Settings
    // ============================================

    /// Read a persisted setting
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    /// Persist a setting, replacing any previous value
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, format_ts(Utc::now())],
        )?;
        Ok(())
    }
}
