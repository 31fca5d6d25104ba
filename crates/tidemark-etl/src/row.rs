//! Row model
//!
//! The engine only looks at one field of a row: its extraction timestamp.
//! Everything else is payload owned by the source and sink adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row moved by a pipeline.
pub trait EtlRow: Clone + Send + Sync + 'static {
    /// The timestamp the row is ordered and checkpointed by
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Schema-less row produced by the SQL source and consumed by the SQL sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UntypedRow {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl UntypedRow {
    pub fn new(timestamp: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        Self { timestamp, fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Values of `keys` in order, `Null` for missing fields.
    ///
    /// Used as the grouping key by the aggregators.
    pub fn project(&self, keys: &[String]) -> Vec<Value> {
        keys.iter()
            .map(|key| self.fields.get(key).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn into_json(self) -> Value {
        Value::Object(self.fields)
    }
}

impl EtlRow for UntypedRow {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
