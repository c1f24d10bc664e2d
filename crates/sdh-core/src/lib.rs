//! Core domain model for the service desk harvester.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

pub const CRATE_NAME: &str = "sdh-core";

/// Ticket identifier.
///
/// The remote API delivers ids as JSON numbers while the checkpoint file keys
/// them as strings. Both are normalized to the decimal string form so equality
/// and ordering agree no matter where an id came from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// Reads an id out of an API payload value (number or string).
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => {
                if let Some(v) = n.as_u64() {
                    Some(Self(v.to_string()))
                } else {
                    n.as_i64().map(|v| Self(v.to_string()))
                }
            }
            JsonValue::String(s) if !s.trim().is_empty() => Some(Self::new(s.as_str())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for TicketId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for TicketId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Plain-text content harvested for one resolved ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub description: String,
    pub resolution: String,
}

impl TicketRecord {
    pub fn new(description: impl Into<String>, resolution: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            resolution: resolution.into(),
        }
    }

    /// Checkpoint form of the record.
    pub fn to_json(&self) -> JsonValue {
        json!({
            "description": self.description,
            "resolution": self.resolution,
        })
    }
}

/// Records persisted by a previous run, keyed by id. Values are kept as raw
/// JSON so fields this tool does not write itself survive a rewrite, and a
/// record with an unexpected shape never invalidates the rest of the file.
/// Read-only once loaded.
pub type Checkpoint = BTreeMap<TicketId, JsonValue>;

/// Records fetched during the current run.
pub type ResultSet = BTreeMap<TicketId, TicketRecord>;

/// What gets written back: checkpoint entries plus new results, sorted by id.
pub type Snapshot = BTreeMap<TicketId, JsonValue>;

/// Union of checkpoint and fresh results. Checkpoint entries win on key
/// collision and are carried over verbatim.
pub fn merge_snapshot(checkpoint: &Checkpoint, results: ResultSet) -> Snapshot {
    let mut merged: Snapshot = results
        .into_iter()
        .map(|(id, record)| (id, record.to_json()))
        .collect();
    for (id, record) in checkpoint {
        merged.insert(id.clone(), record.clone());
    }
    merged
}
