//! Wire format for derived events: the flat JSON document sent to the
//! model-persistence topic, with structured fields duplicated as `*_str`
//! columns for the index layer.

use serde_json::{json, Map, Value};

use crate::broker::{OutgoingMessage, HEADER_SOURCE_ID, HEADER_SOURCE_TYPE};
use crate::model::{Event, EventDetail, EventTask};

/// Header value marking a produced message as an event-model document.
pub const SOURCE_TYPE_EVENT_MODEL: &str = "event_model";

/// Serialize one event into its broker message.
pub fn event_to_message(
    event: &Event,
    task: &EventTask,
    topic: &str,
) -> Result<OutgoingMessage, serde_json::Error> {
    let index_base = &task.storage_config.index_base;

    let mut doc = Map::new();
    doc.insert("category".to_owned(), json!("event"));
    doc.insert("__data_type".to_owned(), json!(index_base));
    doc.insert("__index_base".to_owned(), json!(index_base));
    doc.insert("type".to_owned(), json!(index_base));

    doc.insert("event_message".to_owned(), json!(event.message));
    doc.insert("context_str".to_owned(), json!(serde_json::to_string(&event.context)?));
    doc.insert("context".to_owned(), serde_json::to_value(&event.context)?);
    doc.insert("id".to_owned(), json!(event.base.id));
    doc.insert("title".to_owned(), json!(event.base.title));
    doc.insert("event_model_id".to_owned(), json!(event.base.event_model_id));
    doc.insert("event_type".to_owned(), json!(event.base.event_type));
    match &event.detail {
        EventDetail::Atomic { detect_type, detect_algo } => {
            doc.insert("detect_type".to_owned(), json!(detect_type));
            doc.insert("detect_algo".to_owned(), json!(detect_algo));
        }
        EventDetail::Aggregate { aggregate_type, aggregate_algo } => {
            doc.insert("aggregate_type".to_owned(), json!(aggregate_type));
            doc.insert("aggregate_algo".to_owned(), json!(aggregate_algo));
        }
    }
    doc.insert("level".to_owned(), json!(event.base.level.code()));
    doc.insert("level_name".to_owned(), json!(event.base.level_name));
    doc.insert("generate_type".to_owned(), json!(event.base.generate_type));
    doc.insert("@timestamp".to_owned(), json!(event.base.create_time));
    doc.insert("trigger_time".to_owned(), json!(event.trigger_time));
    doc.insert(
        "trigger_data_str".to_owned(),
        json!(serde_json::to_string(&event.trigger_data)?),
    );

    doc.insert("tags".to_owned(), json!(event.base.tags));
    doc.insert("event_model_name".to_owned(), json!(event.base.event_model_name));
    doc.insert("data_source".to_owned(), json!(event.base.data_source));
    doc.insert("data_source_name".to_owned(), json!(event.base.data_source_name));
    doc.insert("data_source_type".to_owned(), json!(event.base.data_source_type));
    doc.insert("labels_str".to_owned(), json!(serde_json::to_string(&event.base.labels)?));
    doc.insert(
        "relations_str".to_owned(),
        json!(serde_json::to_string(&event.base.relations)?),
    );
    doc.insert("relations".to_owned(), serde_json::to_value(&event.base.relations)?);
    doc.insert(
        "default_time_window_str".to_owned(),
        json!(serde_json::to_string(&event.base.default_time_window)?),
    );
    doc.insert(
        "schedule_str".to_owned(),
        json!(serde_json::to_string(&event.base.schedule)?),
    );

    let payload = serde_json::to_vec(&Value::Object(doc))?;
    Ok(OutgoingMessage {
        topic: topic.to_owned(),
        payload,
        headers: vec![
            (HEADER_SOURCE_ID.to_owned(), event.base.event_model_id.clone().into_bytes()),
            (HEADER_SOURCE_TYPE.to_owned(), SOURCE_TYPE_EVENT_MODEL.as_bytes().to_vec()),
        ],
        kind: event.kind(),
    })
}
