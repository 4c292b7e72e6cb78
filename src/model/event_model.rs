//! Event-model configuration: detection rules, aggregation rules, and the
//! persistence task the model is bound to.
//!
//! Models are fetched from the event-model service, immutable per query, and
//! cached briefly by the subscription pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use super::level::Level;

/// Detect rule types skipped by the streaming pipeline (AI-driven rules are
/// evaluated elsewhere).
pub const AGI_DETECT: &str = "agi_detect";
/// Aggregate rule type skipped by the streaming pipeline.
pub const AGI_AGGREGATION: &str = "agi_aggregation";

// =============================================================================
// Rule DSL
// =============================================================================

/// One leaf comparison: `record[name] <operation> value`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterExpress {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub operation: String,
}

/// Recursive boolean-expression tree.
///
/// An internal node carries `logic_operator` (`and`/`or`) and evaluates its
/// children only; a leaf node evaluates its `filter_express`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicFilter {
    #[serde(default)]
    pub logic_operator: String,
    #[serde(default)]
    pub filter_express: FilterExpress,
    #[serde(default)]
    pub children: Vec<LogicFilter>,
}

/// One detection formula item: a severity level guarded by a filter tree.
/// Items are evaluated in ascending level order; first match wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormulaItem {
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub filter: LogicFilter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectRule {
    #[serde(rename = "id", default)]
    pub detect_rule_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "type", default)]
    pub rule_type: String,
    #[serde(default)]
    pub formula: Vec<FormulaItem>,
    #[serde(default)]
    pub detect_algo: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateRule {
    #[serde(rename = "id", default)]
    pub aggregate_rule_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "type", default)]
    pub rule_type: String,
    #[serde(default)]
    pub aggregate_algo: String,
    #[serde(default)]
    pub group_fields: Vec<String>,
}

// =============================================================================
// Schedule & storage
// =============================================================================

/// Default query window, e.g. `{interval: 5, unit: "m"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub unit: String,
}

impl TimeWindow {
    /// Window length in milliseconds. Unknown or missing units yield 0,
    /// which callers treat as "no back-fill".
    pub fn millis(&self) -> i64 {
        let unit_ms = match self.unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            "y" => 31_536_000_000,
            _ => 0,
        };
        self.interval * unit_ms
    }
}

/// Persistence-task schedule, e.g. `{type: "FIX_RATE", expression: "1m"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSchedule {
    #[serde(rename = "type", default)]
    pub schedule_type: String,
    #[serde(default)]
    pub expression: String,
}

impl TaskSchedule {
    /// Scheduling interval in milliseconds, parsed from expressions like
    /// `30s`, `1m`, `2h`. Unparseable expressions yield 0.
    pub fn interval_millis(&self) -> i64 {
        let expr = self.expression.trim();
        let split = expr.find(|c: char| !c.is_ascii_digit()).unwrap_or(expr.len());
        let (digits, unit) = expr.split_at(split);
        let value: i64 = match digits.parse() {
            Ok(v) => v,
            Err(_) => return 0,
        };
        value
            * match unit {
                "ms" => 1,
                "s" => 1_000,
                "m" => 60_000,
                "h" => 3_600_000,
                "d" => 86_400_000,
                _ => 0,
            }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub index_base: String,
    #[serde(default)]
    pub data_view_id: String,
    #[serde(default)]
    pub data_view_name: String,
}

/// The persistence task bound to a model: where derived events are stored
/// and how often the batch evaluator runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTask {
    #[serde(rename = "id", default)]
    pub task_id: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub schedule: TaskSchedule,
    #[serde(default)]
    pub storage_config: StorageConfig,
}

// =============================================================================
// Event model
// =============================================================================

/// How an event came to be: produced by the streaming pipeline or by the
/// scheduled batch evaluator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GenerateType {
    #[default]
    Batch,
    Streaming,
}

/// Rule configuration for one event model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventModel {
    #[serde(rename = "id", default)]
    pub id: String,
    #[serde(rename = "name", default)]
    pub name: String,
    /// `atomic` or `aggregate`.
    #[serde(rename = "type", default)]
    pub model_type: String,
    #[serde(rename = "tags", default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub data_source_type: String,
    #[serde(default)]
    pub data_source: Vec<String>,
    #[serde(default)]
    pub data_source_name: Vec<String>,
    #[serde(default)]
    pub data_source_group_name: Vec<String>,
    #[serde(default)]
    pub detect_rule: DetectRule,
    #[serde(default)]
    pub aggregate_rule: AggregateRule,
    #[serde(default)]
    pub default_time_window: TimeWindow,
    #[serde(rename = "persist_task_config", default)]
    pub task: EventTask,
    #[serde(default)]
    pub is_active: i32,
    #[serde(default)]
    pub enable_subscribe: i32,
    #[serde(default)]
    pub downstream_dependent_model: Vec<String>,
    #[serde(default)]
    pub update_time: i64,
}

impl EventModel {
    pub fn is_atomic(&self) -> bool {
        self.model_type == "atomic"
    }

    pub fn is_aggregate(&self) -> bool {
        self.model_type == "aggregate"
    }

    /// Streaming when subscription is enabled and the batch schedule is not
    /// active; batch otherwise.
    pub fn generate_type(&self) -> GenerateType {
        if self.enable_subscribe == 1 && self.is_active == 0 {
            GenerateType::Streaming
        } else {
            GenerateType::Batch
        }
    }

    /// True when the model's rules are AI-driven and must be skipped by the
    /// rule-based paths.
    pub fn uses_agi_rules(&self) -> bool {
        self.detect_rule.rule_type == AGI_DETECT || self.aggregate_rule.rule_type == AGI_AGGREGATION
    }
}
