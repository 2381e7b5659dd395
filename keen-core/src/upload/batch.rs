//! Batch bodies and per-event results
//!
//! A batch body is `{"collection": [event, ...], ...}`. The API answers with
//! the same shape, one `{"success": bool, "error": {...}}` per event, in
//! the order the events were sent.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::db::{EventId, PendingEvent};
use crate::error::{Error, Result};

/// Error names for events the API will never accept
pub const PERMANENT_ERRORS: &[&str] = &[
    "InvalidCollectionNameError",
    "InvalidPropertyNameError",
    "InvalidPropertyValueError",
];

/// Whether an event rejected with `name` should be dropped
pub fn is_permanent_error(name: &str) -> bool {
    PERMANENT_ERRORS.contains(&name)
}

/// One request body and the events it carries
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub body: Vec<u8>,
    /// Event ids per collection, in the order they appear in `body`
    pub collections: Vec<(String, Vec<EventId>)>,
}

impl UploadBatch {
    pub fn event_count(&self) -> usize {
        self.collections.iter().map(|(_, ids)| ids.len()).sum()
    }

    pub fn event_ids(&self) -> impl Iterator<Item = EventId> + '_ {
        self.collections.iter().flat_map(|(_, ids)| ids.iter().copied())
    }
}

/// Batches ready to send, plus events that could not be decoded
#[derive(Debug, Default)]
pub struct PreparedBatches {
    pub batches: Vec<UploadBatch>,
    pub corrupt: Vec<EventId>,
}

/// Group events by collection and split them into bodies of at most
/// `max_request_bytes`
///
/// An event too large to share a request is sent on its own.
pub fn build_batches(
    events: &BTreeMap<EventId, PendingEvent>,
    max_request_bytes: usize,
) -> Result<PreparedBatches> {
    let mut prepared = PreparedBatches::default();

    let mut by_collection: BTreeMap<&str, Vec<(EventId, Value, usize)>> = BTreeMap::new();
    for (id, event) in events {
        match serde_json::from_slice::<Value>(&event.payload) {
            Ok(value @ Value::Object(_)) => {
                // Sized as re-encoded, which may differ from the stored bytes
                let len = serde_json::to_vec(&value)
                    .map_err(|e| Error::Serialization(e.to_string()))?
                    .len();
                by_collection
                    .entry(event.collection.as_str())
                    .or_default()
                    .push((*id, value, len));
            }
            Ok(_) => {
                tracing::warn!(id, "Stored event is not a JSON object");
                prepared.corrupt.push(*id);
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "Stored event is not valid JSON");
                prepared.corrupt.push(*id);
            }
        }
    }

    let mut current = BatchBuilder::default();
    for (collection, items) in by_collection {
        let key_len = serde_json::to_string(collection)
            .map_err(|e| Error::Serialization(e.to_string()))?
            .len();

        for (id, value, len) in items {
            let cost = current.cost_of(collection, key_len, len);
            if !current.is_empty() && current.size + cost > max_request_bytes {
                prepared.batches.push(std::mem::take(&mut current).finish()?);
            }
            let cost = current.cost_of(collection, key_len, len);
            current.push(collection, id, value, cost);
        }
    }
    if !current.is_empty() {
        prepared.batches.push(current.finish()?);
    }

    Ok(prepared)
}

struct BatchBuilder {
    body: Map<String, Value>,
    collections: Vec<(String, Vec<EventId>)>,
    size: usize,
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self {
            body: Map::new(),
            collections: Vec::new(),
            // "{}"
            size: 2,
        }
    }
}

impl BatchBuilder {
    fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Bytes an event adds to the compact encoding of the body
    fn cost_of(&self, collection: &str, key_len: usize, event_len: usize) -> usize {
        match self.collections.last() {
            Some((last, _)) if last == collection => event_len + 1,
            // key, ':', "[]", plus ',' between collections
            Some(_) => key_len + 4 + event_len,
            None => key_len + 3 + event_len,
        }
    }

    fn push(&mut self, collection: &str, id: EventId, value: Value, cost: usize) {
        let same_collection = matches!(self.collections.last(), Some((last, _)) if last == collection);
        if !same_collection {
            self.collections.push((collection.to_string(), Vec::new()));
            self.body
                .insert(collection.to_string(), Value::Array(Vec::new()));
        }
        if let Some((_, ids)) = self.collections.last_mut() {
            ids.push(id);
        }
        if let Some(Value::Array(events)) = self.body.get_mut(collection) {
            events.push(value);
        }
        self.size += cost;
    }

    fn finish(self) -> Result<UploadBatch> {
        let body = serde_json::to_vec(&self.body).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(UploadBatch {
            body,
            collections: self.collections,
        })
    }
}

/// What happened to one event of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Delivered,
    /// Rejected for good; the event is dropped
    Rejected { name: String, description: String },
    /// Not accepted this time; the event stays queued
    Retry { name: String, description: String },
}

/// Per-event result, aligned with the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    pub event_id: EventId,
    pub collection: String,
    pub outcome: EventOutcome,
}

#[derive(Debug, Deserialize)]
struct ApiEventResult {
    success: bool,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

/// Match a 2xx response body to the events of `batch`
pub fn parse_response(body: &[u8], batch: &UploadBatch) -> Result<Vec<EventResult>> {
    let parsed: HashMap<String, Vec<ApiEventResult>> = serde_json::from_slice(body)
        .map_err(|e| Error::Response(format!("unexpected upload response: {}", e)))?;

    let mut results = Vec::with_capacity(batch.event_count());
    for (collection, ids) in &batch.collections {
        let entries = parsed.get(collection);
        for (index, id) in ids.iter().enumerate() {
            let outcome = match entries.and_then(|e| e.get(index)) {
                Some(entry) if entry.success => EventOutcome::Delivered,
                Some(entry) => {
                    let (name, description) = match &entry.error {
                        Some(error) => (error.name.clone(), error.description.clone()),
                        None => ("UnknownError".to_string(), String::new()),
                    };
                    if is_permanent_error(&name) {
                        EventOutcome::Rejected { name, description }
                    } else {
                        EventOutcome::Retry { name, description }
                    }
                }
                None => EventOutcome::Retry {
                    name: "MissingResult".to_string(),
                    description: "response has no result for this event".to_string(),
                },
            };
            results.push(EventResult {
                event_id: *id,
                collection: collection.clone(),
                outcome,
            });
        }
    }
    Ok(results)
}
