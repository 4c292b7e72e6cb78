//! Comparator registry for leaf filter expressions.

use serde_json::Value;
use tracing::warn;

/// Coerce a JSON value to f64 the way the rule DSL expects: numbers as-is,
/// numeric strings parsed.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(field: &Value, target: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(field), as_f64(target)) {
        return a == b;
    }
    field == target
}

fn numeric_cmp(field: &Value, target: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_f64(field), as_f64(target)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// `[from, to)` membership against a two-element range value.
fn in_range(field: &Value, target: &Value) -> bool {
    let Some(v) = as_f64(field) else { return false };
    let Some(bounds) = target.as_array() else { return false };
    if bounds.len() != 2 {
        return false;
    }
    match (as_f64(&bounds[0]), as_f64(&bounds[1])) {
        (Some(from), Some(to)) => from <= v && v < to,
        _ => false,
    }
}

fn in_set(field: &Value, target: &Value) -> bool {
    match target.as_array() {
        Some(items) => items.iter().any(|item| values_equal(field, item)),
        None => false,
    }
}

fn contains(field: &Value, target: &Value) -> bool {
    match field {
        Value::Array(items) => items.iter().any(|item| values_equal(item, target)),
        Value::String(s) => s.contains(&as_text(target)),
        _ => false,
    }
}

/// Apply `operation` to a record field against the rule's comparison value.
/// Unknown operators are a miss, logged once per evaluation.
pub fn exec(operation: &str, field: &Value, target: &Value) -> bool {
    match operation {
        "=" | "==" => values_equal(field, target),
        "!=" => !values_equal(field, target),
        ">" => numeric_cmp(field, target, |a, b| a > b),
        ">=" => numeric_cmp(field, target, |a, b| a >= b),
        "<" => numeric_cmp(field, target, |a, b| a < b),
        "<=" => numeric_cmp(field, target, |a, b| a <= b),
        "range" => in_range(field, target),
        "in" => in_set(field, target),
        "contain" => contains(field, target),
        other => {
            warn!(operation = other, "unsupported filter operation, treating as miss");
            false
        }
    }
}
