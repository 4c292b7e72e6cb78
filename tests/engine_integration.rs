//! Engine Integration Tests
//!
//! Exercises the detection engine end to end against a mocked data-query
//! service: atomic detection, cleared-event handling, aggregation, and the
//! query result filtering and assembly paths.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use uniquery::access::{AccessError, DataModelQuery};
use uniquery::engine::{assemble, combine_filter, dedup_key, extract_labels, EventEngine, LevelStore};
use uniquery::model::{
    AggregateRule, BaseEvent, DetectRule, Event, EventModel, EventQuery, Filter, FilterExpress,
    FormulaItem, Level, Locale, LogicFilter, Record, SortDirection, SourceRecords, StorageConfig,
    TimeWindow,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// Data-query mock returning a canned record batch and capturing every
/// query it receives.
struct StaticDataQuery {
    records: Vec<Record>,
    queries: Mutex<Vec<EventQuery>>,
}

impl StaticDataQuery {
    fn new(records: Vec<Record>) -> Self {
        Self { records, queries: Mutex::new(Vec::new()) }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn captured(&self) -> Vec<EventQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataModelQuery for StaticDataQuery {
    async fn fetch_source_records(
        &self,
        _model: &EventModel,
        query: &EventQuery,
    ) -> Result<SourceRecords, AccessError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(SourceRecords::new(self.records.clone()))
    }
}

fn record(value: Value) -> Record {
    value.as_object().expect("record fixture must be a map").clone()
}

fn leaf(level: Level, name: &str, operation: &str, value: Value) -> FormulaItem {
    FormulaItem {
        level,
        filter: LogicFilter {
            filter_express: FilterExpress {
                name: name.to_string(),
                operation: operation.to_string(),
                value,
            },
            ..Default::default()
        },
    }
}

fn atomic_model(formula: Vec<FormulaItem>) -> EventModel {
    EventModel {
        id: "m-atomic".into(),
        name: "cpu-high".into(),
        model_type: "atomic".into(),
        tags: vec!["infra".into()],
        data_source_type: "data_view".into(),
        data_source: vec!["view-1".into()],
        detect_rule: DetectRule {
            rule_type: "range_detect".into(),
            formula,
            ..Default::default()
        },
        default_time_window: TimeWindow { interval: 5, unit: "m".into() },
        ..Default::default()
    }
}

fn aggregate_model(rule: AggregateRule) -> EventModel {
    EventModel {
        id: "m-agg".into(),
        name: "site-health".into(),
        model_type: "aggregate".into(),
        tags: vec!["site".into()],
        aggregate_rule: rule,
        ..Default::default()
    }
}

fn engine_with(query: Arc<StaticDataQuery>) -> EventEngine {
    EventEngine::new(query, Arc::new(LevelStore::new()))
}

fn event_at(create_time: i64, model_name: &str, level: Level) -> Event {
    Event {
        base: BaseEvent {
            id: format!("evt-{create_time}"),
            event_model_name: model_name.into(),
            level,
            create_time,
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Atomic detection
// =============================================================================

#[tokio::test]
async fn test_instant_query_detects_critical_event() {
    let data = Arc::new(StaticDataQuery::new(vec![record(json!({
        "@timestamp": 1712108595085i64,
        "value": 1.33,
        "labels.host_ip": "localhost"
    }))]));
    let engine = engine_with(data.clone());
    let model = atomic_model(vec![leaf(Level::Critical, "value", "range", json!([1, 4]))]);
    let query = EventQuery { query_type: "instant_query".into(), ..Default::default() };

    let (events, total) = engine.apply(&query, &model, Locale::ZhCn).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(events.len(), 1);

    let event = &events[0];
    assert_eq!(event.base.level, Level::Critical);
    assert_eq!(event.base.level_name, "Critical");
    assert_eq!(event.base.title, "cpu-high_紧急");
    assert_eq!(event.message, "监控对象(localhost)的监控项(value)产生了异常('value':'1.33')");
    assert_eq!(event.base.labels.get("labels.host_ip").unwrap(), "localhost");
    assert_eq!(event.trigger_time, 1712108595085);
    assert_eq!(event.trigger_data.len(), 1);

    // The mock saw a query with the default window filled in.
    let seen = data.captured();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].end > 0);
    assert_eq!(seen[0].end - seen[0].start, 5 * 60_000);
}

#[tokio::test]
async fn test_lowest_level_formula_item_wins() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data);
    // Items deliberately listed out of order; both match the record.
    let model = atomic_model(vec![
        leaf(Level::Warning, "value", ">", json!(0)),
        leaf(Level::Critical, "value", ">", json!(1)),
    ]);
    let records = vec![record(json!({"value": 2.0}))];

    let events = engine.judge(&records, &model, Locale::ZhCn).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].base.level, Level::Critical);
}

#[tokio::test]
async fn test_no_formula_match_yields_no_event() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data);
    let model = atomic_model(vec![leaf(Level::Critical, "value", ">", json!(10))]);
    let records = vec![record(json!({"value": 2.0})), record(json!({"other": 1}))];

    let events = engine.judge(&records, &model, Locale::ZhCn).await.unwrap();
    assert!(events.is_empty());
}

// =============================================================================
// Cleared-event handling
// =============================================================================

fn cleared_model() -> EventModel {
    atomic_model(vec![
        leaf(Level::Critical, "value", "range", json!([1, 4])),
        leaf(Level::Cleared, "value", "range", json!([0, 1])),
    ])
}

#[tokio::test]
async fn test_cleared_event_carries_prior_event() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data);
    let model = cleared_model();
    let rec = record(json!({"value": 0.5, "labels.host_ip": "localhost"}));
    let key = dedup_key(&model.id, &extract_labels(&rec));

    engine.level_store().update(&key, Level::Critical, "prior-id");

    let events = engine.judge(&[rec.clone()], &model, Locale::ZhCn).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].base.level, Level::Cleared);
    assert_eq!(events[0].context.pre_order_event.level, Level::Critical);
    assert_eq!(events[0].context.pre_order_event.id, "prior-id");

    // A second cleared hit finds nothing active and is suppressed.
    let again = engine.judge(&[rec], &model, Locale::ZhCn).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(engine.level_store().get(&key).unwrap().level, Level::Normal);
}

#[tokio::test]
async fn test_cleared_event_suppressed_without_history() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data.clone());
    let model = cleared_model();
    let rec = record(json!({"value": 0.2, "labels.host_ip": "localhost"}));
    let key = dedup_key(&model.id, &extract_labels(&rec));

    // No in-memory state and no persisted history: nothing to clear.
    let events = engine.judge(&[rec], &model, Locale::ZhCn).await.unwrap();
    assert!(events.is_empty());
    assert_eq!(engine.level_store().get(&key).unwrap().level, Level::Normal);

    // The fallback lookup went through the persisted-event path.
    assert_eq!(data.captured().len(), 1);
}

#[tokio::test]
async fn test_active_hit_updates_level_store() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data);
    let model = cleared_model();
    let rec = record(json!({"value": 2.5, "labels.host_ip": "localhost"}));
    let key = dedup_key(&model.id, &extract_labels(&rec));

    let events = engine.judge(&[rec], &model, Locale::ZhCn).await.unwrap();
    assert_eq!(events.len(), 1);
    let stored = engine.level_store().get(&key).unwrap();
    assert_eq!(stored.level, Level::Critical);
    assert_eq!(stored.id, events[0].base.id);
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn test_healthy_aggregate_picks_worst_bucket() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data);
    let model = aggregate_model(AggregateRule {
        rule_type: "healthy_compute".into(),
        aggregate_algo: "MaxLevelMap".into(),
        ..Default::default()
    });
    let records = vec![
        record(json!({"@timestamp": 100i64, "level": 3})),
        record(json!({"@timestamp": 200i64, "level": 2})),
    ];

    let events = engine.judge(&records, &model, Locale::ZhCn).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.base.level, Level::Major);
    assert_eq!(event.context.score, 39.0);
    assert_eq!(event.message, "基于,生成了一个等级为主要的聚合事件");
    assert_eq!(event.trigger_time, 100);
    assert!(event.trigger_data.is_empty());
}

#[tokio::test]
async fn test_group_aggregate_prepends_group_tags() {
    let data = Arc::new(StaticDataQuery::empty());
    let engine = engine_with(data);
    let model = aggregate_model(AggregateRule {
        rule_type: "group_aggregation".into(),
        aggregate_algo: "EventDataGroupAggregation".into(),
        group_fields: vec!["host".into()],
        ..Default::default()
    });
    let records = vec![
        record(json!({"host": "a", "level": 1})),
        record(json!({"host": "b", "level": 3})),
        record(json!({"host": "c"})),
    ];

    let mut events = engine.judge(&records, &model, Locale::ZhCn).await.unwrap();
    // The record without a level is skipped entirely.
    assert_eq!(events.len(), 2);
    events.sort_by(|a, b| a.base.tags.cmp(&b.base.tags));
    assert_eq!(events[0].base.tags, vec!["a".to_string(), "site".to_string()]);
    assert_eq!(events[0].base.level, Level::Critical);
    assert_eq!(events[1].base.tags, vec!["b".to_string(), "site".to_string()]);
    assert_eq!(events[1].base.level, Level::Minor);
}

// =============================================================================
// Persisted-event queries
// =============================================================================

#[tokio::test]
async fn test_range_query_rehydrates_persisted_rows() {
    let model = EventModel {
        id: "m-atomic".into(),
        name: "cpu-high".into(),
        model_type: "atomic".into(),
        task: uniquery::model::EventTask {
            storage_config: StorageConfig {
                index_base: "event_idx".into(),
                data_view_id: "view-events".into(),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let row = record(json!({
        "id": "evt-1",
        "event_model_id": "m-atomic",
        "event_type": "atomic",
        "type": "event_idx",
        "level": 1,
        "@timestamp": "2024-04-03T02:23:15Z",
        "event_message": "stored message",
        "labels_str": "{\"labels.host_ip\":\"localhost\"}",
        "detect_type": "rule_detect",
        "detect_algo": "range_detect"
    }));
    let data = Arc::new(StaticDataQuery::new(vec![row]));
    let engine = engine_with(data.clone());
    let query = EventQuery { query_type: "range_query".into(), ..Default::default() };

    let (events, total) = engine.apply(&query, &model, Locale::ZhCn).await.unwrap();
    assert_eq!(total, 1);
    let event = &events[0];
    // The row's type column holds the index base; the real model type is
    // restored from the event_type column.
    assert_eq!(event.base.event_type, "atomic");
    assert_eq!(event.base.create_time, 1712110995000);
    assert_eq!(event.message, "stored message");
    assert_eq!(event.base.labels.get("labels.host_ip").unwrap(), "localhost");

    // The persisted query is scoped to the model and skips empty messages.
    let seen = data.captured();
    let extraction = &seen[0].extraction;
    assert!(extraction.iter().any(|f| f.name == "event_message" && f.operation == "!="));
    assert!(extraction.iter().any(|f| f.name == "event_model_id" && f.operation == "="));
}

// =============================================================================
// Filtering and assembly
// =============================================================================

#[test]
fn test_combine_filter_on_level() {
    let events = vec![
        event_at(1, "a", Level::Critical),
        event_at(2, "b", Level::Warning),
        event_at(3, "c", Level::Critical),
    ];
    let filters = vec![Filter::new("level", "=", json!(1))];
    let (filtered, total) = combine_filter(events, &filters);
    assert_eq!(total, 2);
    assert!(filtered.iter().all(|e| e.base.level == Level::Critical));
}

#[test]
fn test_assemble_sorts_and_paginates() {
    let events: Vec<Event> =
        (0..25).map(|i| event_at(i, "m", Level::Warning)).collect();

    // Default page size when limit is 0.
    let page = assemble(events.clone(), "@timestamp", SortDirection::Asc, 0, 0);
    assert_eq!(page.len(), 10);
    assert_eq!(page[0].base.create_time, 0);

    // Descending with an explicit page.
    let page = assemble(events.clone(), "@timestamp", SortDirection::Desc, 5, 5);
    assert_eq!(page.len(), 5);
    assert_eq!(page[0].base.create_time, 19);

    // Negative limit returns everything.
    let page = assemble(events.clone(), "@timestamp", SortDirection::Asc, -1, 0);
    assert_eq!(page.len(), 25);

    // Out-of-range offset falls back to the first page.
    let page = assemble(events, "@timestamp", SortDirection::Asc, 10, 100);
    assert_eq!(page.len(), 10);
    assert_eq!(page[0].base.create_time, 0);
}

#[test]
fn test_assemble_unknown_sort_key_preserves_order() {
    let events = vec![
        event_at(3, "c", Level::Warning),
        event_at(1, "a", Level::Warning),
        event_at(2, "b", Level::Warning),
    ];
    let page = assemble(events, "nonsense", SortDirection::Asc, -1, 0);
    assert_eq!(page[0].base.create_time, 3);
    assert_eq!(page[1].base.create_time, 1);
}
