//! Failed-query bookkeeping
//!
//! A query row exists only while a query is failing: it is created on the
//! first failed attempt and its `attempts` counter grows with each failed
//! retry. It is deleted on success or once it has not been attempted for
//! longer than the query TTL. A row that ran out of attempts stays until then
//! and keeps the query from being sent again.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::time::Duration;

use super::store::EventStore;
use super::{format_ts, parse_ts};

/// A persisted query that failed at least once
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    /// Row id
    pub id: i64,
    /// Wire name of the query type (`count`, `funnel`, `saved`, ...)
    pub query_type: String,
    /// Name for saved analyses and datasets
    pub query_name: Option<String>,
    /// Parameters the query was issued with
    pub properties: serde_json::Value,
    /// Stable identity of the query within the project
    pub query_key: String,
    /// Failed attempts so far
    pub attempts: u32,
    /// When the query was last attempted
    pub last_attempt_at: DateTime<Utc>,
    /// When the query first failed
    pub created_at: DateTime<Utc>,
}

impl EventStore {
    /// Record a failed attempt, creating the row on first failure
    ///
    /// Returns the row as it stands after the update.
    pub fn record_query_failure(
        &self,
        query_type: &str,
        query_name: Option<&str>,
        properties: &serde_json::Value,
        query_key: &str,
    ) -> Result<QueryRecord> {
        let now = format_ts(Utc::now());
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO queries (project_id, query_type, query_name, properties, query_key,
                                 attempts, last_attempt_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
            ON CONFLICT(project_id, query_key) DO UPDATE SET
                attempts = attempts + 1,
                last_attempt_at = excluded.last_attempt_at
            "#,
            params![
                self.project_id(),
                query_type,
                query_name,
                properties.to_string(),
                query_key,
                now,
            ],
        )?;

        let record = tx.query_row(
            "SELECT * FROM queries WHERE project_id = ?1 AND query_key = ?2",
            params![self.project_id(), query_key],
            Self::row_to_query,
        )?;
        tx.commit()?;

        Ok(record)
    }

    /// Look up the record for a query, if it has failed before
    pub fn find_query(&self, query_key: &str) -> Result<Option<QueryRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM queries WHERE project_id = ?1 AND query_key = ?2",
            params![self.project_id(), query_key],
            Self::row_to_query,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All failed queries of the project, oldest first
    pub fn list_queries(&self) -> Result<Vec<QueryRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM queries WHERE project_id = ?1 ORDER BY id ASC")?;
        let records = stmt
            .query_map([self.project_id()], Self::row_to_query)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Delete a query row by id
    pub fn delete_query(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM queries WHERE project_id = ?1 AND id = ?2",
            params![self.project_id(), id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete a query row by key
    pub fn delete_query_by_key(&self, query_key: &str) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM queries WHERE project_id = ?1 AND query_key = ?2",
            params![self.project_id(), query_key],
        )?;
        Ok(deleted > 0)
    }

    /// Delete queries not attempted within `ttl`
    pub fn delete_expired_queries(&self, ttl: Duration) -> Result<usize> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("invalid query TTL: {}", e)))?;
        self.delete_queries_attempted_before(Utc::now() - ttl)
    }

    /// Delete queries whose last attempt is strictly older than `cutoff`
    pub fn delete_queries_attempted_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM queries WHERE project_id = ?1 AND last_attempt_at < ?2",
            params![self.project_id(), format_ts(cutoff)],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Expired failed queries");
        }
        Ok(deleted)
    }

    /// Delete every query row of the project
    pub fn delete_all_queries(&self) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM queries WHERE project_id = ?1",
            [self.project_id()],
        )?;
        Ok(deleted)
    }

    /// Number of failed queries awaiting retry
    pub fn get_query_count(&self) -> usize {
        let conn = self.conn();
        match conn.query_row(
            "SELECT COUNT(*) FROM queries WHERE project_id = ?1",
            [self.project_id()],
            |r| r.get::<_, i64>(0),
        ) {
            Ok(count) => count as usize,
            Err(e) => {
                tracing::error!(error = %e, "Failed to count queries");
                0
            }
        }
    }

    fn row_to_query(row: &Row) -> rusqlite::Result<QueryRecord> {
        let properties: String = row.get("properties")?;
        let last_attempt_at: String = row.get("last_attempt_at")?;
        let created_at: String = row.get("created_at")?;

        Ok(QueryRecord {
            id: row.get("id")?,
            query_type: row.get("query_type")?,
            query_name: row.get("query_name")?,
            properties: serde_json::from_str(&properties).unwrap_or(serde_json::Value::Null),
            query_key: row.get("query_key")?,
            attempts: row.get("attempts")?,
            last_attempt_at: parse_ts(&last_attempt_at),
            created_at: parse_ts(&created_at),
        })
    }
}
