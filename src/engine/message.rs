//! Human-readable message composition for derived events.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{Level, Locale, Record};

/// Render a field value for a message: strings verbatim, whole numbers
/// plain, fractional numbers with two decimals.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => format!("{}", f as i64),
                Some(f) => format!("{f:.2}"),
                None => n.to_string(),
            },
        },
        other => other.to_string(),
    }
}

/// The monitored-entity rendering: label values in label-key order.
pub fn entity_name(labels: &BTreeMap<String, String>) -> String {
    labels.values().cloned().collect::<Vec<_>>().join(",")
}

/// Message for an atomic event.
///
/// With referenced fields the message names each field and its value; with
/// none it falls back to the record's `value` field.
pub fn compose_atomic(
    labels: &BTreeMap<String, String>,
    compare_element: &Record,
    record: &Record,
    locale: Locale,
) -> String {
    let entity = entity_name(labels);
    if compare_element.is_empty() {
        let current = record.get("value").map(render_value).unwrap_or_default();
        return match locale {
            Locale::ZhCn => {
                format!("监控对象({entity})的监控项([])产生了异常(当前值为'{current}')")
            }
            Locale::EnUs => format!(
                "The monitored object ({entity}) item ([]) produced an anomaly (current value '{current}')"
            ),
        };
    }

    let names = compare_element.keys().cloned().collect::<Vec<_>>().join(",");
    let pairs = compare_element
        .iter()
        .map(|(name, value)| format!("'{}':'{}'", name, render_value(value)))
        .collect::<Vec<_>>()
        .join(",");
    match locale {
        Locale::ZhCn => {
            format!("监控对象({entity})的监控项({names})产生了异常({pairs})")
        }
        Locale::EnUs => format!(
            "The monitored object ({entity}) item ({names}) produced an anomaly ({pairs})"
        ),
    }
}

/// Message for an aggregate event. The `Normal` level renders an empty
/// level name, which is kept rather than special-cased.
pub fn compose_aggregate(group_fields: &[String], level: Level, locale: Locale) -> String {
    let fields = group_fields.join(",");
    match locale {
        Locale::ZhCn => {
            format!("基于{fields},生成了一个等级为{}的聚合事件", level.name_zh())
        }
        Locale::EnUs => format!(
            "Based on {fields}, generated an aggregate event of level {}",
            level.name_en()
        ),
    }
}
