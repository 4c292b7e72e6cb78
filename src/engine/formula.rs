//! Formula evaluation: the recursive boolean tree and first-match-wins
//! selection across a model's severity formula.

use serde_json::Map;

use crate::model::{FormulaItem, LogicFilter, Record};

use super::compare;

/// Evaluate one filter tree against a flattened record.
///
/// Internal nodes (non-empty children plus an `and`/`or` operator) combine
/// their children and union the referenced-field maps; their own leaf
/// expression is not consulted. A leaf on a missing field is a miss with an
/// empty field map.
pub fn traversal(filter: &LogicFilter, record: &Record) -> (bool, Record) {
    let is_internal = !filter.children.is_empty()
        && (filter.logic_operator == "and" || filter.logic_operator == "or");

    if is_internal {
        let mut fields = Map::new();
        if filter.logic_operator == "and" {
            let mut hit = true;
            for child in &filter.children {
                let (child_hit, child_fields) = traversal(child, record);
                hit = hit && child_hit;
                fields.extend(child_fields);
            }
            (hit, fields)
        } else {
            let mut hit = false;
            for child in &filter.children {
                let (child_hit, child_fields) = traversal(child, record);
                hit = hit || child_hit;
                fields.extend(child_fields);
            }
            (hit, fields)
        }
    } else {
        let expr = &filter.filter_express;
        let mut fields = Map::new();
        match record.get(&expr.name) {
            Some(value) => {
                fields.insert(expr.name.clone(), value.clone());
                (compare::exec(&expr.operation, value, &expr.value), fields)
            }
            None => (false, fields),
        }
    }
}

/// Evaluate the formula items in ascending level order and return the first
/// hit together with the fields its filter referenced.
pub fn call<'a>(record: &Record, formula: &'a [FormulaItem]) -> Option<(&'a FormulaItem, Record)> {
    let mut ordered: Vec<&FormulaItem> = formula.iter().collect();
    ordered.sort_by_key(|item| item.level);
    for item in ordered {
        let (hit, fields) = traversal(&item.filter, record);
        if hit {
            return Some((item, fields));
        }
    }
    None
}
