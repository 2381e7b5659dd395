//! # keen-core
//!
//! Client library for the Keen event API.
//!
//! This library provides:
//! - A durable local event queue on SQLite, with per-collection caps and
//!   at-least-once upload semantics
//! - Batched, size-bounded event upload with per-event result handling
//! - Analysis, funnel, multi-analysis, saved and dataset queries, with
//!   bounded retries for failed queries
//! - Configuration management and logging infrastructure
//!
//! ## Event lifecycle
//!
//! Added events are validated, stamped with `keen.timestamp`, and stored
//! as committed rows. An upload cycle marks them pending and sends them.
//! Delivered or permanently rejected events are deleted; everything else
//! returns to the committed state and is sent again next cycle, until it
//! has used up `upload.max_event_upload_attempts`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use keen_core::{Config, KeenClient};
//! use serde_json::json;
//!
//! # async fn run() -> keen_core::Result<()> {
//! let config = Config::load()?;
//! let client = KeenClient::open(&config)?;
//!
//! client.add_event_value("purchases", json!({"item": "golden widget", "price": 25}))?;
//! let report = client.upload().await?;
//! println!("sent {} events", report.events_sent);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use client::KeenClient;
pub use config::{Config, ProjectConfig, ProxyConfig};
pub use db::{EventId, EventStore, StoreLimits};
pub use error::{Error, EventFailure, Result};
pub use event::{GlobalProperties, KeenProperties};
pub use network::{AnalysisType, NetworkClient, Query, QueryType};
pub use upload::{UploadReport, UploadState, Uploader};

// Public modules
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod legacy;
pub mod logging;
pub mod network;
pub mod upload;
