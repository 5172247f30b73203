//! Flattens an object into a map of dotted field paths to stringified
//! values, the form consumed by field selectors and payload templates.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Flat projection of a JSON object: `metadata.labels.app` -> `"web"`.
/// List entries are addressed by integer index, `spec.containers.0.name`.
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("cannot flatten an empty object")]
    EmptyObject,
    #[error("top-level JSON value is not an object")]
    NotAnObject,
}

/// Flattens `value` into a [`FieldMap`]. The root must be a non-empty JSON
/// object; arrays and scalars at the root are rejected.
pub fn flatten(value: &Value) -> Result<FieldMap, Error> {
    let map = match value {
        Value::Object(map) => map,
        _ => return Err(Error::NotAnObject),
    };
    if map.is_empty() {
        return Err(Error::EmptyObject);
    }
    let mut fields = FieldMap::new();
    for (key, child) in map {
        flatten_into(&mut fields, key.clone(), child);
    }
    Ok(fields)
}

fn flatten_into(fields: &mut FieldMap, path: String, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(fields, format!("{path}.{key}"), child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(fields, format!("{path}.{index}"), child);
            }
        }
        Value::String(s) => {
            fields.insert(path, s.clone());
        }
        Value::Bool(b) => {
            fields.insert(path, b.to_string());
        }
        // Number's Display renders integers exactly and floats in their
        // shortest round-trippable form.
        Value::Number(n) => {
            fields.insert(path, n.to_string());
        }
        Value::Null => {
            fields.insert(path, String::new());
        }
    }
}
