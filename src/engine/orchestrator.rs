//! Query orchestration and the detection state machine.
//!
//! `EventEngine` drives the instant and range query paths: fetch source
//! records, evaluate detection formulas, apply post-hoc filters, then sort
//! and paginate. The same `judge` entry point serves the streaming pipeline.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::access::DataModelQuery;
use crate::model::{
    record_timestamp_millis, BaseEvent, Event, EventContext, EventDetail, EventDetailsQuery,
    EventModel, EventQuery, Filter, Level, Locale, PersistedEvent, Record, SortDirection,
    SourceRecords, DEFAULT_QUERY_LIMIT, QUERY_TYPE_INSTANT, QUERY_TYPE_RANGE,
};

use super::aggregate;
use super::formula;
use super::message;
use super::state::{dedup_key, extract_labels, LevelStore};
use super::EngineError;

/// Window for the fallback prior-level lookup, in schedule intervals.
const LAST_LEVEL_LOOKBACK_CYCLES: i64 = 2;
/// Sentinel full-history window in milliseconds, used when a query passes
/// `start == end == -1`.
const FULL_HISTORY_WINDOW_MS: i64 = 31_536_000_000;

const DETECT_TYPE_RULE: &str = "rule_detect";
const AGGREGATE_TYPE_HEALTHY: &str = "healthy_compute";
const AGGREGATE_TYPE_GROUP: &str = "group_aggregation";
const ALGO_MAX_LEVEL_MAP: &str = "MaxLevelMap";
const ALGO_EVENT_DATA_GROUP: &str = "EventDataGroupAggregation";
const ALGO_SOURCE_DATA_GROUP: &str = "SourceDataGroupAggregation";

pub struct EventEngine {
    data_query: Arc<dyn DataModelQuery>,
    level_store: Arc<LevelStore>,
}

impl EventEngine {
    pub fn new(data_query: Arc<dyn DataModelQuery>, level_store: Arc<LevelStore>) -> Self {
        Self { data_query, level_store }
    }

    pub fn level_store(&self) -> &Arc<LevelStore> {
        &self.level_store
    }

    /// Entry point: dispatch on query type. Unknown types yield no events.
    pub async fn apply(
        &self,
        query: &EventQuery,
        model: &EventModel,
        locale: Locale,
    ) -> Result<(Vec<Event>, usize), EngineError> {
        match query.query_type.as_str() {
            QUERY_TYPE_INSTANT => self.instant_query(query, model, locale).await,
            QUERY_TYPE_RANGE => self.range_query(query, model).await,
            other => {
                warn!(query_type = other, "unsupported query type");
                Ok((Vec::new(), 0))
            }
        }
    }

    /// Fetch live source data and run detection over it.
    pub async fn instant_query(
        &self,
        query: &EventQuery,
        model: &EventModel,
        locale: Locale,
    ) -> Result<(Vec<Event>, usize), EngineError> {
        let events = self.rule_detect(query, model, locale).await?;
        if events.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let (events, total) = combine_filter(events, &query.filters);
        let events =
            assemble(events, &query.sort_key, query.direction, query.limit, query.offset);
        Ok((events, total))
    }

    /// Query already-persisted events for the model.
    pub async fn range_query(
        &self,
        query: &EventQuery,
        model: &EventModel,
    ) -> Result<(Vec<Event>, usize), EngineError> {
        let events = self.persist_query(query, model, true, true).await?;
        let (events, total) = combine_filter(events, &query.filters);
        let events =
            assemble(events, &query.sort_key, query.direction, query.limit, query.offset);
        Ok((events, total))
    }

    async fn rule_detect(
        &self,
        query: &EventQuery,
        model: &EventModel,
        locale: Locale,
    ) -> Result<Vec<Event>, EngineError> {
        let records = self.fetch_source_records(query, model).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.judge(&records.records, model, locale).await
    }

    /// Fetch source records from the model's data source, filling a missing
    /// time range from the model's default window.
    pub async fn fetch_source_records(
        &self,
        query: &EventQuery,
        model: &EventModel,
    ) -> Result<SourceRecords, EngineError> {
        let mut query = query.clone();
        fill_time_range(&mut query, model);
        let records = self.data_query.fetch_source_records(model, &query).await?;
        Ok(records)
    }

    /// Classify a batch of records into derived events.
    ///
    /// Atomic models run the formula state machine per record; aggregate
    /// models fold the whole batch through the configured combinator.
    pub async fn judge(
        &self,
        records: &[Record],
        model: &EventModel,
        locale: Locale,
    ) -> Result<Vec<Event>, EngineError> {
        if model.is_atomic() {
            return self.judge_atomic(records, model, locale).await;
        }
        if model.is_aggregate() {
            return Ok(self.judge_aggregate(records, model, locale));
        }
        warn!(model_type = %model.model_type, model_id = %model.id, "unknown model type");
        Ok(Vec::new())
    }

    async fn judge_atomic(
        &self,
        records: &[Record],
        model: &EventModel,
        locale: Locale,
    ) -> Result<Vec<Event>, EngineError> {
        let formula = &model.detect_rule.formula;
        let mut events = Vec::new();

        for record in records {
            let Some((item, element)) = formula::call(record, formula) else { continue };

            let labels = extract_labels(record);
            let key = dedup_key(&model.id, &labels);
            let mut last_level = Level::Normal;
            let mut last_id = String::new();

            if item.level == Level::Cleared {
                match self.level_store.get(&key) {
                    Some(prior) => {
                        if !prior.level.is_active() {
                            // Nothing to clear; remember we are back to normal.
                            self.level_store.reset(&key);
                            continue;
                        }
                        last_level = prior.level;
                        last_id = prior.id;
                    }
                    None => {
                        last_level = self.get_last_event_level(&key, model).await;
                        if !last_level.is_active() {
                            self.level_store.reset(&key);
                            continue;
                        }
                    }
                }
            }

            let mut event = build_atomic_event(model, item.level, &element, record, locale);
            if event.base.level == Level::Cleared {
                event.context.pre_order_event.level = last_level;
                event.context.pre_order_event.id = last_id;
                debug!(
                    event_id = %event.base.id,
                    pre_order_id = %event.context.pre_order_event.id,
                    "emitting cleared event"
                );
            }
            self.level_store.update(&key, event.base.level, &event.base.id);
            events.push(event);
        }
        Ok(events)
    }

    fn judge_aggregate(&self, records: &[Record], model: &EventModel, locale: Locale) -> Vec<Event> {
        let rule = &model.aggregate_rule;
        match (rule.rule_type.as_str(), rule.aggregate_algo.as_str()) {
            (AGGREGATE_TYPE_HEALTHY, ALGO_MAX_LEVEL_MAP) => {
                match aggregate::combine(records, None) {
                    Some(context) => {
                        vec![build_aggregate_event(model, context, Vec::new(), records, locale)]
                    }
                    None => Vec::new(),
                }
            }
            (AGGREGATE_TYPE_GROUP, algo @ (ALGO_EVENT_DATA_GROUP | ALGO_SOURCE_DATA_GROUP)) => {
                let missing = if algo == ALGO_SOURCE_DATA_GROUP {
                    Some(Level::Indeterminate)
                } else {
                    None
                };
                aggregate::group_combine(records, &rule.group_fields, missing)
                    .into_iter()
                    .map(|(group_key, context)| {
                        let additional =
                            group_key.split(',').map(str::to_owned).collect::<Vec<_>>();
                        build_aggregate_event(model, context, additional, records, locale)
                    })
                    .collect()
            }
            (rule_type, algo) => {
                warn!(rule_type, algo, model_id = %model.id, "unsupported aggregate rule");
                Vec::new()
            }
        }
    }

    /// The last level emitted for a dedup key, recovered from persisted
    /// events when the in-memory store has no entry (fresh process).
    pub async fn get_last_event_level(&self, key: &str, model: &EventModel) -> Level {
        let end = Utc::now().timestamp_millis();
        let schedule_ms = model.task.schedule.interval_millis();
        let query = EventQuery {
            id: model.id.clone(),
            start: end - LAST_LEVEL_LOOKBACK_CYCLES * schedule_ms,
            end,
            direction: SortDirection::Desc,
            ..Default::default()
        };

        let events = match self.persist_query(&query, model, true, true).await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, model_id = %model.id, "prior-level lookup failed");
                return Level::Normal;
            }
        };
        // Results arrive in ascending time order; walk backwards for the
        // most recent event of the same entity.
        for event in events.iter().rev() {
            if dedup_key(&model.id, &event.base.labels) == key {
                return event.base.level;
            }
        }
        Level::Normal
    }

    /// Query persisted events through the model's storage data view.
    ///
    /// `time_limit` fills absent time bounds from the default window (with
    /// the `-1/-1` sentinel opening the full history); `model_scoped`
    /// restricts to this model's events and includes the heavyweight
    /// context and trigger data in the result.
    pub async fn persist_query(
        &self,
        query: &EventQuery,
        model: &EventModel,
        time_limit: bool,
        model_scoped: bool,
    ) -> Result<Vec<Event>, EngineError> {
        let mut query = query.clone();
        if time_limit {
            if query.end == 0 {
                query.end = Utc::now().timestamp_millis();
            }
            if query.start == 0 || (query.start == query.end && query.end != -1) {
                query.start = query.end - model.default_time_window.millis();
            }
            if query.start == -1 && query.end == -1 {
                query.end = Utc::now().timestamp_millis();
                query.start = query.end - FULL_HISTORY_WINDOW_MS;
            }
        }

        // Rows without a composed message are index bookkeeping, not events.
        if !query.enable_message_filter {
            query.extraction.push(Filter::new("event_message", "!=", Value::String(String::new())));
        }
        if model_scoped {
            query.extraction.push(Filter::new(
                "event_model_id",
                "=",
                Value::String(model.id.clone()),
            ));
        }

        let storage_model = storage_view_model(model);
        let records = self.data_query.fetch_source_records(&storage_model, &query).await?;

        let mut events = Vec::with_capacity(records.records.len());
        for mut record in records.records {
            // The index stores the model type under event_type; the row's
            // own type column holds the index base.
            let event_type = record.get("event_type").and_then(Value::as_str).map(str::to_owned);
            if record.get("@timestamp").is_some_and(Value::is_string) {
                let millis = record_timestamp_millis(&record).unwrap_or_default();
                record.insert("@timestamp".to_owned(), Value::from(millis));
            }

            let persisted: PersistedEvent =
                serde_json::from_value(Value::Object(record)).map_err(EngineError::InvalidRow)?;
            let mut event = persisted.into_event()?;
            if let Some(event_type) = event_type {
                event.base.event_type = event_type;
            }
            if !model_scoped {
                event.context = EventContext::default();
                event.trigger_data = Vec::new();
            }
            events.push(event);
        }
        Ok(events)
    }

    /// Fetch one persisted event by id, scoped to a model.
    pub async fn query_event_by_id(
        &self,
        model: &EventModel,
        details: &EventDetailsQuery,
    ) -> Result<Event, EngineError> {
        let query = EventQuery {
            start: details.start,
            end: details.end,
            extraction: vec![
                Filter::new("id", "=", Value::String(details.event_id.clone())),
                Filter::new("event_model_id", "=", Value::String(details.event_model_id.clone())),
            ],
            enable_message_filter: true,
            ..Default::default()
        };
        let storage_model = storage_view_model(model);
        let records = self.data_query.fetch_source_records(&storage_model, &query).await?;
        if records.is_empty() {
            error!(event_id = %details.event_id, "event not found");
            return Err(EngineError::EventNotFound { event_id: details.event_id.clone() });
        }

        let mut events = Vec::new();
        for mut record in records.records {
            let event_type = record.get("event_type").and_then(Value::as_str).map(str::to_owned);
            if record.get("@timestamp").is_some_and(Value::is_string) {
                let millis = record_timestamp_millis(&record).unwrap_or_default();
                record.insert("@timestamp".to_owned(), Value::from(millis));
            }
            let persisted: PersistedEvent =
                serde_json::from_value(Value::Object(record)).map_err(EngineError::InvalidRow)?;
            let mut event = persisted.into_event()?;
            if let Some(event_type) = event_type {
                event.base.event_type = event_type;
            }
            events.push(event);
        }
        events
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::EventNotFound { event_id: details.event_id.clone() })
    }
}

/// Fill absent query time bounds from the model's default window.
fn fill_time_range(query: &mut EventQuery, model: &EventModel) {
    if query.end == 0 {
        query.end = Utc::now().timestamp_millis();
    }
    if query.start == 0 || query.start == query.end {
        query.start = query.end - model.default_time_window.millis();
    }
}

/// Rewire a model at its storage data view so event rows can be fetched
/// through the same query path as source data.
fn storage_view_model(model: &EventModel) -> EventModel {
    let mut storage_model = model.clone();
    storage_model.data_source_type = "data_view".to_owned();
    let view_id = model.task.storage_config.data_view_id.clone();
    if storage_model.data_source.is_empty() {
        storage_model.data_source.push(view_id);
    } else {
        storage_model.data_source[0] = view_id;
    }
    storage_model
}

fn record_trigger_time(record: &Record) -> i64 {
    record_timestamp_millis(record).unwrap_or_default()
}

fn build_atomic_event(
    model: &EventModel,
    level: Level,
    element: &Record,
    record: &Record,
    locale: Locale,
) -> Event {
    let labels = extract_labels(record);
    Event {
        base: BaseEvent {
            id: Uuid::new_v4().simple().to_string(),
            title: Event::compose_title(&model.name, level, locale),
            event_model_id: model.id.clone(),
            event_model_name: model.name.clone(),
            event_type: model.model_type.clone(),
            level,
            level_name: level.name_en().to_owned(),
            tags: model.tags.clone(),
            generate_type: model.generate_type().to_string(),
            create_time: Utc::now().timestamp_millis(),
            data_source: model.data_source.clone(),
            data_source_name: model.data_source_name.clone(),
            data_source_group_name: model.data_source_group_name.clone(),
            data_source_type: model.data_source_type.clone(),
            default_time_window: model.default_time_window.clone(),
            schedule: model.task.schedule.clone(),
            labels: labels.clone(),
            ..Default::default()
        },
        message: message::compose_atomic(&labels, element, record, locale),
        trigger_time: record_trigger_time(record),
        trigger_data: vec![record.clone()],
        detail: EventDetail::Atomic {
            detect_type: DETECT_TYPE_RULE.to_owned(),
            detect_algo: model.detect_rule.rule_type.clone(),
        },
        ..Default::default()
    }
}

fn build_aggregate_event(
    model: &EventModel,
    context: EventContext,
    additional_tags: Vec<String>,
    records: &[Record],
    locale: Locale,
) -> Event {
    let level = context.level;
    let mut tags = additional_tags;
    tags.extend(model.tags.iter().cloned());
    let trigger_time = records.first().map(record_trigger_time).unwrap_or_default();
    Event {
        base: BaseEvent {
            id: Uuid::new_v4().simple().to_string(),
            title: Event::compose_title(&model.name, level, locale),
            event_model_id: model.id.clone(),
            event_model_name: model.name.clone(),
            event_type: model.model_type.clone(),
            level,
            level_name: level.name_en().to_owned(),
            tags,
            generate_type: model.generate_type().to_string(),
            create_time: Utc::now().timestamp_millis(),
            data_source: model.data_source.clone(),
            data_source_name: model.data_source_name.clone(),
            data_source_group_name: model.data_source_group_name.clone(),
            data_source_type: model.data_source_type.clone(),
            default_time_window: model.default_time_window.clone(),
            schedule: model.task.schedule.clone(),
            ..Default::default()
        },
        message: message::compose_aggregate(
            &model.aggregate_rule.group_fields,
            level,
            locale,
        ),
        trigger_time,
        trigger_data: Vec::new(),
        detail: EventDetail::Aggregate {
            aggregate_type: model.aggregate_rule.rule_type.clone(),
            aggregate_algo: model.aggregate_rule.aggregate_algo.clone(),
        },
        context,
        ..Default::default()
    }
}

// =============================================================================
// Post-hoc filtering & assembly
// =============================================================================

fn event_field(event: &Event, name: &str) -> Option<Value> {
    match name {
        "level" => Some(Value::from(event.base.level.code())),
        "tags" => Some(Value::from(event.base.tags.clone())),
        "type" => Some(Value::from(event.base.event_type.clone())),
        "id" => Some(Value::from(event.base.id.clone())),
        _ => None,
    }
}

fn filter_hits(event: &Event, filter: &Filter) -> Option<bool> {
    let field = event_field(event, &filter.name)?;
    let hit = match filter.operation.as_str() {
        "=" => super::compare::exec("=", &field, &filter.value),
        "in" => super::compare::exec("in", &field, &filter.value),
        "contain" => match (field.as_array(), filter.value.as_array()) {
            // Every requested value must appear in the field array.
            (Some(items), Some(wanted)) => {
                !items.is_empty() && wanted.iter().all(|w| items.contains(w))
            }
            (Some(items), None) => items.contains(&filter.value),
            _ => false,
        },
        other => {
            error!(operation = other, "unsupported result filter operation");
            true
        }
    };
    Some(hit)
}

fn mit(event: &Event, filters: &[Filter]) -> bool {
    for filter in filters {
        match filter_hits(event, filter) {
            Some(true) => {}
            Some(false) => return false,
            None => {
                // Unsupported filter columns pass the event through.
                error!(column = %filter.name, "unsupported result filter column");
                return true;
            }
        }
    }
    true
}

/// Apply post-hoc result filters. Only `level`, `tags`, `type` and `id`
/// are filterable; empty filters pass everything.
pub fn combine_filter(events: Vec<Event>, filters: &[Filter]) -> (Vec<Event>, usize) {
    if filters.is_empty() {
        let total = events.len();
        return (events, total);
    }
    let filtered: Vec<Event> = events.into_iter().filter(|event| mit(event, filters)).collect();
    let total = filtered.len();
    (filtered, total)
}

/// Sort and paginate a merged result set.
///
/// `limit == 0` applies the default page size, `limit < 0` returns all,
/// and an out-of-range offset falls back to 0.
pub fn assemble(
    mut events: Vec<Event>,
    sort_key: &str,
    direction: SortDirection,
    mut limit: i64,
    mut offset: i64,
) -> Vec<Event> {
    let asc = direction == SortDirection::Asc;
    match sort_key {
        "@timestamp" | "" => events.sort_by(|a, b| {
            let ord = a.base.create_time.cmp(&b.base.create_time);
            if asc { ord } else { ord.reverse() }
        }),
        "trigger_time" => events.sort_by(|a, b| {
            let ord = a.trigger_time.cmp(&b.trigger_time);
            if asc { ord } else { ord.reverse() }
        }),
        "level" => events.sort_by(|a, b| {
            let ord = a.base.level.cmp(&b.base.level);
            if asc { ord } else { ord.reverse() }
        }),
        "event_model_name" => events.sort_by(|a, b| {
            let ord = a.base.event_model_name.cmp(&b.base.event_model_name);
            if asc { ord } else { ord.reverse() }
        }),
        "type" => events.sort_by(|a, b| {
            let ord = a.base.event_type.cmp(&b.base.event_type);
            if asc { ord } else { ord.reverse() }
        }),
        "event_model_id" => events.sort_by(|a, b| {
            let ord = a.base.event_model_id.cmp(&b.base.event_model_id);
            if asc { ord } else { ord.reverse() }
        }),
        other => {
            debug!(sort_key = other, "unsupported sort key, leaving order as-is");
        }
    }

    let len = events.len() as i64;
    if limit == 0 {
        limit = DEFAULT_QUERY_LIMIT;
    }
    if offset < 0 || offset > len {
        offset = 0;
    }
    let start = if offset > 0 && offset < len { offset } else { 0 };
    if limit < 0 {
        limit = len;
    }
    let end = (offset + limit).min(len);
    events.drain(..start as usize);
    events.truncate((end - start).max(0) as usize);
    events
}
