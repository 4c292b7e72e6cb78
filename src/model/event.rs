//! Derived events and their persisted form.
//!
//! `Event` is the in-memory shape the engine produces; `PersistedEvent` is
//! the row shape the index layer hands back, with some structured fields
//! duplicated as JSON strings (`*_str` columns) that must be re-parsed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::event_model::{TaskSchedule, TimeWindow};
use super::level::{Level, Locale};
use super::record::Record;

#[derive(Debug, Error)]
pub enum EventDataError {
    #[error("invalid {column} column: {source}")]
    InvalidColumn {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Atomic or aggregate, carried on every event instead of being inferred
/// from which rule struct is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    Atomic,
    Aggregate,
}

/// The prior event recorded for a dedup key, consulted when a `Cleared`
/// formula level matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreOrderEvent {
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub id: String,
}

/// Structured context attached to every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub source_records: Vec<Record>,
    #[serde(default)]
    pub group_fields: Vec<String>,
    #[serde(default)]
    pub pre_order_event: PreOrderEvent,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub incident_id: String,
}

/// Fields shared by atomic and aggregate events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub event_model_id: String,
    #[serde(default)]
    pub event_model_name: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub level_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub generate_type: String,
    /// Epoch millis; serialized as `@timestamp` to match the index mapping.
    #[serde(rename = "@timestamp", default)]
    pub create_time: i64,
    #[serde(default)]
    pub data_source: Vec<String>,
    #[serde(default)]
    pub data_source_name: Vec<String>,
    #[serde(default)]
    pub data_source_group_name: Vec<String>,
    #[serde(default)]
    pub data_source_type: String,
    #[serde(default)]
    pub default_time_window: TimeWindow,
    #[serde(default)]
    pub schedule: TaskSchedule,
    /// Sorted for deterministic dedup keys and entity rendering.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, Value>,
    /// Index document id, present only on rows read back from storage.
    #[serde(rename = "__id", default, skip_serializing_if = "String::is_empty")]
    pub doc_id: String,
}

/// Per-kind payload. Detection provenance for atomic events, aggregation
/// provenance for aggregate ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventDetail {
    Atomic {
        #[serde(default)]
        detect_type: String,
        #[serde(default)]
        detect_algo: String,
    },
    Aggregate {
        #[serde(default)]
        aggregate_type: String,
        #[serde(default)]
        aggregate_algo: String,
    },
}

impl Default for EventDetail {
    fn default() -> Self {
        EventDetail::Atomic { detect_type: String::new(), detect_algo: String::new() }
    }
}

/// A derived event produced by detection or aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: EventContext,
    #[serde(default)]
    pub trigger_time: i64,
    #[serde(default)]
    pub trigger_data: Vec<Record>,
    #[serde(flatten)]
    pub detail: EventDetail,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self.detail {
            EventDetail::Atomic { .. } => EventKind::Atomic,
            EventDetail::Aggregate { .. } => EventKind::Aggregate,
        }
    }

    /// Title is `{model name}_{localized level name}`.
    pub fn compose_title(model_name: &str, level: Level, locale: Locale) -> String {
        format!("{}_{}", model_name, level.name(locale))
    }
}

// =============================================================================
// Persisted form
// =============================================================================

fn parse_str_column<T: Default + for<'de> Deserialize<'de>>(
    raw: &str,
    column: &'static str,
) -> Result<T, EventDataError> {
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|source| EventDataError::InvalidColumn { column, source })
}

/// An event row as stored: structured fields flattened, with JSON-string
/// duplicates for the nested ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistedEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub event_message: String,
    #[serde(default)]
    pub context_str: String,
    #[serde(default)]
    pub default_time_window_str: String,
    #[serde(default)]
    pub labels_str: String,
    #[serde(default)]
    pub relations_str: String,
    #[serde(default)]
    pub schedule_str: String,
    #[serde(default)]
    pub trigger_time: i64,
    #[serde(default)]
    pub trigger_data_str: String,
    #[serde(default)]
    pub aggregate_type: String,
    #[serde(default)]
    pub aggregate_algo: String,
    #[serde(default)]
    pub detect_type: String,
    #[serde(default)]
    pub detect_algo: String,
}

impl PersistedEvent {
    /// Rebuild the in-memory event, re-parsing each `*_str` column. Empty
    /// columns yield the field's default; malformed JSON is an error.
    pub fn into_event(self) -> Result<Event, EventDataError> {
        let context: EventContext = parse_str_column(&self.context_str, "context_str")?;
        let default_time_window: TimeWindow =
            parse_str_column(&self.default_time_window_str, "default_time_window_str")?;
        let labels: BTreeMap<String, String> = parse_str_column(&self.labels_str, "labels_str")?;
        let relations: BTreeMap<String, Value> =
            parse_str_column(&self.relations_str, "relations_str")?;
        let schedule: TaskSchedule = parse_str_column(&self.schedule_str, "schedule_str")?;
        let trigger_data: Vec<Record> =
            parse_str_column(&self.trigger_data_str, "trigger_data_str")?;

        let detail = if self.aggregate_type.is_empty() && self.aggregate_algo.is_empty() {
            EventDetail::Atomic { detect_type: self.detect_type, detect_algo: self.detect_algo }
        } else {
            EventDetail::Aggregate {
                aggregate_type: self.aggregate_type,
                aggregate_algo: self.aggregate_algo,
            }
        };

        // The searchable copy lives in event_message; message is only a
        // fallback for rows written before the split.
        let message =
            if self.event_message.is_empty() { self.message } else { self.event_message };

        let mut base = self.base;
        base.default_time_window = default_time_window;
        base.labels = labels;
        base.relations = relations;
        base.schedule = schedule;

        Ok(Event {
            base,
            message,
            context,
            trigger_time: self.trigger_time,
            trigger_data,
            detail,
        })
    }
}
