//! Aggregation combinators: bucket classified records by severity and fold
//! them into a single derived context, globally or per grouping key.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{EventContext, Level, Record, SEVERITY_PRIORITY};

use super::message::render_value;

/// Score band per severity: `(lower, upper)` on the 0..100 health scale.
fn score_band(level: Level) -> (i64, i64) {
    match level {
        Level::Critical => (0, 20),
        Level::Major => (20, 40),
        Level::Minor => (40, 60),
        Level::Warning => (60, 80),
        Level::Indeterminate => (80, 90),
        Level::Cleared | Level::Normal => (90, 100),
    }
}

/// Health score for a bucket: starts at the band's upper bound and drops by
/// one per contributing record, floored at the lower bound.
fn bucket_score(level: Level, count: usize) -> f64 {
    let (lower, upper) = score_band(level);
    (upper - count as i64).max(lower) as f64
}

fn record_level(record: &Record, missing: Option<Level>) -> Option<Level> {
    match record.get("level") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|code| u8::try_from(code).ok())
            .and_then(|code| Level::try_from(code).ok()),
        Some(Value::String(s)) => {
            s.parse::<u8>().ok().and_then(|code| Level::try_from(code).ok())
        }
        _ => missing,
    }
}

/// Bucket records by their severity level. `missing` supplies the level for
/// records without one (the source-data variant uses `Indeterminate`; the
/// event-data variant drops such records).
pub fn bucket_by_level(
    records: &[Record],
    missing: Option<Level>,
) -> BTreeMap<Level, Vec<Record>> {
    let mut buckets: BTreeMap<Level, Vec<Record>> = BTreeMap::new();
    for record in records {
        if let Some(level) = record_level(record, missing) {
            buckets.entry(level).or_default().push(record.clone());
        }
    }
    buckets
}

/// Fold a batch into one context: the worst non-empty severity bucket wins,
/// in fixed priority order regardless of input ordering.
pub fn combine(records: &[Record], missing: Option<Level>) -> Option<EventContext> {
    let buckets = bucket_by_level(records, missing);
    for level in SEVERITY_PRIORITY {
        if let Some(bucket) = buckets.get(&level) {
            if bucket.is_empty() {
                continue;
            }
            return Some(EventContext {
                score: bucket_score(level, bucket.len()),
                level,
                source_records: bucket.clone(),
                ..Default::default()
            });
        }
    }
    None
}

/// Composite grouping key: the record's group-field values joined by `,`.
/// Missing fields render empty.
pub fn group_key(record: &Record, group_fields: &[String]) -> String {
    group_fields
        .iter()
        .map(|field| record.get(field).map(render_value).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",")
}

/// Fold a batch per grouping key: one context per group, keyed by the
/// composite value string. Keys come out in lexicographic order.
pub fn group_combine(
    records: &[Record],
    group_fields: &[String],
    missing: Option<Level>,
) -> Vec<(String, EventContext)> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        groups.entry(group_key(record, group_fields)).or_default().push(record.clone());
    }

    let mut combined = Vec::with_capacity(groups.len());
    for (key, group) in groups {
        if let Some(mut context) = combine(&group, missing) {
            context.group_fields = group_fields.to_vec();
            combined.push((key, context));
        }
    }
    combined
}
