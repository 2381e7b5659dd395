//! Error types for keen-core

use thiserror::Error;

use crate::db::EventId;

/// Main error type for the keen-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Event or collection rejected before it reached the store
    #[error("validation error: {0}")]
    Validation(String),

    /// No request was attempted because the network is unreachable
    #[error("network is disconnected")]
    NetworkDisconnected,

    /// A request was attempted but no response was received
    #[error("transport error: {0}")]
    Transport(String),

    /// A response was received with a status outside 2xx
    #[error("API error ({status}): {body}")]
    HttpStatus { status: u16, body: String },

    /// A request payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A 2xx response body could not be interpreted
    #[error("invalid response: {0}")]
    Response(String),

    /// The batch was accepted but some events were rejected by the server
    #[error("{} event(s) failed to upload", failures.len())]
    EventUpload { failures: Vec<EventFailure> },

    /// Another upload cycle is already running
    #[error("an upload is already in progress")]
    UploadInProgress,

    /// The query already failed as often as allowed and was not sent
    #[error("query abandoned after {attempts} failed attempt(s)")]
    QueryAbandoned { attempts: u32 },
}

impl Error {
    /// True for failures where the request never produced a response
    pub fn is_network(&self) -> bool {
        matches!(self, Error::NetworkDisconnected | Error::Transport(_))
    }

    /// True for failures that a later attempt may resolve
    pub fn is_transient(&self) -> bool {
        match self {
            Error::NetworkDisconnected | Error::Transport(_) => true,
            Error::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A single event the server rejected inside an otherwise successful batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFailure {
    /// Local row the event came from
    pub event_id: EventId,
    /// Collection the event was sent to
    pub collection: String,
    /// Error name reported by the API (e.g. `InvalidPropertyNameError`)
    pub name: String,
    /// Human-readable description from the API
    pub description: String,
    /// Whether the event was dropped (permanent) or kept for another attempt
    pub dropped: bool,
}

/// Result type alias for keen-core
pub type Result<T> = std::result::Result<T, Error>;
