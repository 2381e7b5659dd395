//! Event upload pipeline
//!
//! [`Uploader`] moves events from the [`EventStore`](crate::db::EventStore)
//! to the API. [`batch`] holds the wire-level pieces: body construction,
//! size-bounded splitting, and per-event response parsing.

pub mod batch;
pub mod uploader;

pub use batch::{is_permanent_error, EventOutcome, UploadBatch, PERMANENT_ERRORS};
pub use uploader::{UploadReport, UploadState, UploadStats, Uploader};
