//! Event assembly and validation
//!
//! Events are JSON objects. Before an event reaches the store it is checked
//! against the API naming rules, merged with any global properties, and
//! stamped with a `keen.timestamp`.
//!
//! Precedence, lowest to highest: global property map, global property
//! closure, the event itself. The same order applies to keys inside the
//! `keen` object, except that an explicit [`KeenProperties::timestamp`]
//! always wins.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Key of the object that holds API-reserved properties
pub const KEEN_NAMESPACE: &str = "keen";

/// Longest allowed collection or property name, in characters
pub const MAX_NAME_LENGTH: usize = 256;

/// Closure producing global properties for a collection
pub type GlobalPropertiesFn = Arc<dyn Fn(&str) -> Map<String, Value> + Send + Sync>;

/// Properties that override what the SDK would fill in itself
#[derive(Debug, Clone, Default)]
pub struct KeenProperties {
    /// Event time; defaults to the time the event is added
    pub timestamp: Option<DateTime<Utc>>,
}

/// Properties merged into every event
#[derive(Clone, Default)]
pub struct GlobalProperties {
    /// Static properties
    pub map: Option<Map<String, Value>>,
    /// Properties computed per collection at add time
    pub provider: Option<GlobalPropertiesFn>,
}

impl std::fmt::Debug for GlobalProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalProperties")
            .field("map", &self.map)
            .field("provider", &self.provider.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Check a collection name against the API naming rules
pub fn validate_collection(collection: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(Error::Validation(
            "collection name must not be empty".to_string(),
        ));
    }
    if collection.starts_with('$') {
        return Err(Error::Validation(format!(
            "collection name {:?} must not start with '$'",
            collection
        )));
    }
    if collection.chars().count() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "collection name must be at most {} characters",
            MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

/// Check every property name in an event, recursively
pub fn validate_event(event: &Map<String, Value>) -> Result<()> {
    if let Some(keen) = event.get(KEEN_NAMESPACE) {
        if !keen.is_object() {
            return Err(Error::Validation(format!(
                "property {:?} must be an object",
                KEEN_NAMESPACE
            )));
        }
    }
    validate_properties(event, "")
}

fn validate_properties(properties: &Map<String, Value>, path: &str) -> Result<()> {
    for (name, value) in properties {
        validate_property_name(name, path)?;
        let child = if path.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", path, name)
        };
        validate_value(value, &child)?;
    }
    Ok(())
}

fn validate_value(value: &Value, path: &str) -> Result<()> {
    match value {
        Value::Object(map) => validate_properties(map, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| validate_value(item, &format!("{}[{}]", path, i))),
        _ => Ok(()),
    }
}

fn validate_property_name(name: &str, path: &str) -> Result<()> {
    let location = || {
        if path.is_empty() {
            format!("{:?}", name)
        } else {
            format!("{:?} (in {})", name, path)
        }
    };

    if name.is_empty() {
        return Err(Error::Validation(format!(
            "property names must not be empty{}",
            if path.is_empty() {
                String::new()
            } else {
                format!(" (in {})", path)
            }
        )));
    }
    if name.starts_with('$') {
        return Err(Error::Validation(format!(
            "property name {} must not start with '$'",
            location()
        )));
    }
    if name.contains('.') {
        return Err(Error::Validation(format!(
            "property name {} must not contain '.'",
            location()
        )));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "property name {} must be at most {} characters",
            location(),
            MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

/// Merge global properties into an event and stamp the `keen` namespace
///
/// The result is validated, so global properties are held to the same
/// naming rules as the event.
pub fn assemble_event(
    collection: &str,
    event: Map<String, Value>,
    globals: &GlobalProperties,
    keen_properties: &KeenProperties,
    now: DateTime<Utc>,
) -> Result<Map<String, Value>> {
    validate_collection(collection)?;
    validate_event(&event)?;

    let mut merged = Map::new();
    if let Some(map) = &globals.map {
        merge_into(&mut merged, map.clone());
    }
    if let Some(provider) = &globals.provider {
        merge_into(&mut merged, provider(collection));
    }
    merge_into(&mut merged, event);

    let keen = merged
        .entry(KEEN_NAMESPACE)
        .or_insert_with(|| Value::Object(Map::new()));
    let keen = match keen {
        Value::Object(map) => map,
        _ => {
            return Err(Error::Validation(format!(
                "global property {:?} must be an object",
                KEEN_NAMESPACE
            )))
        }
    };

    match keen_properties.timestamp {
        Some(ts) => {
            keen.insert("timestamp".to_string(), Value::String(format_timestamp(ts)));
        }
        None => {
            keen.entry("timestamp")
                .or_insert_with(|| Value::String(format_timestamp(now)));
        }
    }

    validate_event(&merged)?;
    Ok(merged)
}

/// Serialize an assembled event for the store
pub fn serialize_event(event: &Map<String, Value>) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| Error::Serialization(e.to_string()))
}

/// Shallow merge, except `keen` objects which merge key by key
fn merge_into(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        if key == KEEN_NAMESPACE {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (target.get_mut(&key), &value)
            {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
                continue;
            }
        }
        target.insert(key, value);
    }
}

/// ISO-8601 with millisecond precision, as the API expects
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
