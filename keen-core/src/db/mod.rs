//! Database layer for keen
//!
//! This module provides the local event queue using SQLite with:
//! - Schema migrations
//! - The `EventStore` with pending-state tracking and per-collection caps
//! - The failed-query cache used for bounded query retries

pub mod query_cache;
pub mod schema;
pub mod store;

pub use query_cache::QueryRecord;
pub use store::{EventId, EventStore, PendingEvent, StoreLimits};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width RFC 3339 timestamp, so stored values compare correctly as text
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
