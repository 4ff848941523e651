// File: record-sync/src/change_tracker.rs
// Purpose: Change events from the feed, re-delivery dedup and row diffing

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::conflict::FieldValues;

/// A row snapshot as delivered by the change feed
pub type Row = Map<String, Value>;

/// Action performed on a row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Insert => write!(f, "INSERT"),
            ChangeAction::Update => write!(f, "UPDATE"),
            ChangeAction::Delete => write!(f, "DELETE"),
        }
    }
}

/// Opaque token identifying one write transaction.
///
/// Markers are only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitMarker(String);

impl CommitMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommitMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitMarker {
    fn from(marker: &str) -> Self {
        Self::new(marker)
    }
}

/// One notification from the change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub schema: String,
    pub table: String,
    pub commit_timestamp: CommitMarker,
    #[serde(rename = "eventType")]
    pub event_type: ChangeAction,
    /// Row after the write; absent on delete
    #[serde(rename = "new", default, deserialize_with = "empty_row_as_none")]
    pub new_row: Option<Row>,
    /// Row before the write; on delete usually only the primary key
    #[serde(rename = "old", default, deserialize_with = "empty_row_as_none")]
    pub old_row: Option<Row>,
}

// The feed sends `{}` rather than omitting the snapshot.
fn empty_row_as_none<'de, D>(deserializer: D) -> Result<Option<Row>, D::Error>
where
    D: Deserializer<'de>,
{
    let row = Option::<Row>::deserialize(deserializer)?;
    Ok(row.filter(|r| !r.is_empty()))
}

impl ChangeEvent {
    pub fn insert(table: &str, marker: impl Into<CommitMarker>, new_row: Row) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
            commit_timestamp: marker.into(),
            event_type: ChangeAction::Insert,
            new_row: Some(new_row),
            old_row: None,
        }
    }

    pub fn update(
        table: &str,
        marker: impl Into<CommitMarker>,
        old_row: Row,
        new_row: Row,
    ) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
            commit_timestamp: marker.into(),
            event_type: ChangeAction::Update,
            new_row: Some(new_row),
            old_row: Some(old_row),
        }
    }

    pub fn delete(table: &str, marker: impl Into<CommitMarker>, old_row: Row) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
            commit_timestamp: marker.into(),
            event_type: ChangeAction::Delete,
            new_row: None,
            old_row: Some(old_row),
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// Decode a wire payload
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Value of `column` in the newest snapshot carrying it, rendered as text
    pub fn column_text(&self, column: &str) -> Option<String> {
        self.new_row
            .as_ref()
            .and_then(|row| row.get(column))
            .or_else(|| self.old_row.as_ref().and_then(|row| row.get(column)))
            .and_then(value_as_key)
    }
}

/// Render a key column for equality filters; objects and arrays never match.
pub(crate) fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Drops exact re-deliveries of the same commit for one subscription.
///
/// Only exact marker matches are dropped. An older event arriving late with
/// a different marker is still processed.
#[derive(Debug, Default)]
pub struct ChangeEventDeduplicator {
    last_seen: Option<CommitMarker>,
}

impl ChangeEventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call exactly once per arriving event, before any other processing.
    ///
    /// Returns false for a marker equal to the last seen one and leaves
    /// state untouched; otherwise records the marker and returns true.
    pub fn should_process(&mut self, marker: &CommitMarker) -> bool {
        if self.last_seen.as_ref() == Some(marker) {
            tracing::debug!("Dropping re-delivered change {}", marker);
            return false;
        }

        self.last_seen = Some(marker.clone());
        true
    }

    pub fn last_seen(&self) -> Option<&CommitMarker> {
        self.last_seen.as_ref()
    }

    /// See [`diff_fields`]
    pub fn diff_fields(
        before: Option<&Row>,
        after: Option<&Row>,
        structural_keys: &HashSet<String>,
    ) -> FieldValues {
        diff_fields(before, after, structural_keys)
    }
}

/// Fields of `after` whose value differs from `before`.
///
/// Keys in `structural_keys` are compared with [`structurally_equal`], every
/// other key strictly. Returns an empty map when either snapshot is absent.
pub fn diff_fields(
    before: Option<&Row>,
    after: Option<&Row>,
    structural_keys: &HashSet<String>,
) -> FieldValues {
    let (Some(before), Some(after)) = (before, after) else {
        return FieldValues::new();
    };

    after
        .iter()
        .filter(|(key, value)| {
            let previous = before.get(key.as_str());
            if structural_keys.contains(key.as_str()) {
                previous.map_or(true, |prev| !structurally_equal(prev, value))
            } else {
                previous.map_or(true, |prev| !strictly_equal(prev, value))
            }
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// Integer and float encodings of the same number are equal.
fn strictly_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Equality after normalizing serialized and pre-parsed encodings.
///
/// String values are parsed as JSON first; a string that does not parse is
/// compared as-is. Parsed values are compared by canonical serialization.
pub fn structurally_equal(a: &Value, b: &Value) -> bool {
    let a = parse_structural(a);
    let b = parse_structural(b);

    match (serde_json::to_string(&a), serde_json::to_string(&b)) {
        (Ok(left), Ok(right)) => left == right,
        _ => a == b,
    }
}

fn parse_structural(value: &Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}
