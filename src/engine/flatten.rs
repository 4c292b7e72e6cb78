//! Flattening of nested JSON documents into single-level dotted-key records.

use serde_json::{Map, Value};

use crate::model::Record;

use super::EngineError;

/// Flatten a parsed JSON document into a single-level record.
///
/// Keys nest with `.` separators. Empty maps and arrays are kept as values.
/// Arrays of scalars are kept as arrays; arrays of maps or arrays are
/// recursed into under the same key, and when flattening produces the same
/// key twice the values fold into an array.
pub fn flatten_record(src: &Value) -> Result<Record, EngineError> {
    let mut dest = Map::new();
    flatten(true, "", src, &mut dest)?;
    Ok(dest)
}

fn join_key(top: bool, prefix: &str, subkey: &str) -> String {
    if subkey.is_empty() {
        return prefix.to_owned();
    }
    if top {
        format!("{prefix}{subkey}")
    } else {
        format!("{prefix}.{subkey}")
    }
}

fn flatten(top: bool, prefix: &str, src: &Value, dest: &mut Record) -> Result<(), EngineError> {
    match src {
        Value::Object(map) => {
            for (key, val) in map {
                let new_key = join_key(top, prefix, key);
                assign(&new_key, val, dest)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for val in items {
                let new_key = join_key(top, prefix, "");
                assign(&new_key, val, dest)?;
            }
            Ok(())
        }
        _ => Err(EngineError::InvalidDocument),
    }
}

fn assign(new_key: &str, val: &Value, dest: &mut Record) -> Result<(), EngineError> {
    match val {
        Value::Object(map) => {
            if map.is_empty() {
                dest.insert(new_key.to_owned(), val.clone());
                return Ok(());
            }
            flatten(false, new_key, val, dest)
        }
        Value::Array(items) => {
            if items.is_empty() {
                dest.insert(new_key.to_owned(), val.clone());
                return Ok(());
            }
            match items[0] {
                Value::Object(_) | Value::Array(_) => flatten(false, new_key, val, dest),
                _ => {
                    dest.insert(new_key.to_owned(), val.clone());
                    Ok(())
                }
            }
        }
        scalar => {
            match dest.get_mut(new_key) {
                None => {
                    dest.insert(new_key.to_owned(), scalar.clone());
                }
                Some(Value::Array(existing)) => {
                    existing.push(scalar.clone());
                }
                Some(existing) => {
                    let folded = Value::Array(vec![existing.clone(), scalar.clone()]);
                    *existing = folded;
                }
            }
            Ok(())
        }
    }
}
