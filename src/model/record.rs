//! Flattened telemetry records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One flattened record: a single-level map of dotted field names to values.
/// Always carries `@timestamp`; atomic-model records may carry `labels.*`
/// keys that form the dedup key.
pub type Record = Map<String, Value>;

/// A batch of records fetched from one data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRecords {
    #[serde(rename = "source_records", default)]
    pub records: Vec<Record>,
}

impl SourceRecords {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Grouping key for consumed records: where a batch of messages came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSource {
    pub source_id: String,
    pub source_type: String,
}

/// Epoch millis from a record's `@timestamp`, tolerating the formats the
/// index layer emits: integer millis, float millis, or an RFC3339 string.
pub fn record_timestamp_millis(record: &Record) -> Option<i64> {
    match record.get("@timestamp") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis()),
        _ => None,
    }
}
