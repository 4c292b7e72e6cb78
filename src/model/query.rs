//! Query request shapes for the event query service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use super::event_model::{AggregateRule, DetectRule, TimeWindow};

pub const QUERY_TYPE_INSTANT: &str = "instant_query";
pub const QUERY_TYPE_RANGE: &str = "range_query";

/// Default page size when a query asks for `limit == 0`.
pub const DEFAULT_QUERY_LIMIT: i64 = 10;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// A post-hoc filter applied to already-derived events, or an extraction
/// clause forwarded to the index layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub operation: String,
}

impl Filter {
    pub fn new(name: &str, operation: &str, value: Value) -> Self {
        Self { name: name.into(), value, operation: operation.into() }
    }
}

/// One event query: either against a stored model (`id` set) or a preview
/// carrying an inline model definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub extraction: Vec<Filter>,
    #[serde(default)]
    pub preview: i32,
    #[serde(rename = "sort", default)]
    pub sort_key: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub enable_message_filter: bool,

    // Inline model definition for preview queries.
    #[serde(rename = "name", default)]
    pub event_model_name: String,
    #[serde(rename = "type", default)]
    pub event_model_type: String,
    #[serde(rename = "tags", default)]
    pub event_model_tags: Vec<String>,
    #[serde(default)]
    pub data_source_type: String,
    #[serde(default)]
    pub data_source: Vec<String>,
    #[serde(default)]
    pub detect_rule: DetectRule,
    #[serde(default)]
    pub aggregate_rule: AggregateRule,
    #[serde(default)]
    pub default_time_window: TimeWindow,
}

impl EventQuery {
    pub fn is_preview(&self) -> bool {
        self.id.is_empty()
    }
}

/// Batch query request: several queries evaluated independently, then the
/// merged result sorted and paginated with the outer parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQueryReq {
    #[serde(default)]
    pub querys: Vec<EventQuery>,
    #[serde(rename = "sort", default)]
    pub sort_key: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Single-event details lookup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventDetailsQuery {
    pub event_model_id: String,
    pub event_id: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
}
