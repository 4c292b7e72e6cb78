//! Level-transition state per monitored entity.
//!
//! One entry per dedup key, written by the detection path after every emit
//! and read on the next cycle to decide whether a cleared transition fires.
//! Entries live for the lifetime of the process.

use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::model::{Level, PreOrderEvent, Record};

/// Label keys start with this prefix in flattened records.
pub const LABEL_PREFIX: &str = "labels.";

/// Extract the `labels.*` fields of a record as the entity's label set.
/// Non-string label values are rendered as JSON.
pub fn extract_labels(record: &Record) -> BTreeMap<String, String> {
    record
        .iter()
        .filter(|(key, _)| key.starts_with(LABEL_PREFIX))
        .map(|(key, value)| {
            let text = match value.as_str() {
                Some(s) => s.to_owned(),
                None => value.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

/// Deterministic key for one monitored entity: the model id plus the sorted
/// label pairs.
pub fn dedup_key(model_id: &str, labels: &BTreeMap<String, String>) -> String {
    let mut key = String::from(model_id);
    for (name, value) in labels {
        key.push(':');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

/// Concurrent map of dedup key to the last emitted event.
#[derive(Debug, Default)]
pub struct LevelStore {
    entries: DashMap<String, PreOrderEvent>,
}

impl LevelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<PreOrderEvent> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Record the latest emitted level and event id for a key.
    pub fn update(&self, key: &str, level: Level, event_id: &str) {
        self.entries
            .insert(key.to_owned(), PreOrderEvent { level, id: event_id.to_owned() });
    }

    /// Mark a key back to `Normal` without an associated event, used when a
    /// cleared hit is suppressed.
    pub fn reset(&self, key: &str) {
        self.entries.insert(key.to_owned(), PreOrderEvent::default());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
