// src/projection.rs
//! Projections.
//!
//! A projection maps dotted paths to 0 or 1 with an independent `_id`
//! override. Outside of `_id` all entries must agree: all 1 builds the
//! result from the named paths (include mode), all 0 removes them from a
//! copy of the input (exclude mode). Arrays along a projected path propagate
//! element-wise; a pruning pass removes the empty maps left behind by array
//! elements that carried none of the projected paths.

use crate::document::{Map, Value};
use crate::error::{FeatherError, Result};

/// Reshape `doc` according to `spec`. An empty spec returns the document
/// unchanged.
pub fn project(doc: &Value, spec: &Value) -> Result<Value> {
    let map = spec.as_object().ok_or_else(|| {
        FeatherError::InvalidProjection("a projection must be a document".to_string())
    })?;
    if map.is_empty() {
        return Ok(doc.clone());
    }

    let mut keep_id = true;
    let mut mode: Option<bool> = None;
    let mut paths: Vec<&str> = Vec::new();
    for (key, value) in map {
        let include = match value {
            Value::Number(n) if *n == 0.0 => false,
            Value::Number(n) if *n == 1.0 => true,
            Value::Bool(b) => *b,
            other => {
                return Err(FeatherError::InvalidProjection(format!(
                    "projection values must be 0 or 1 (got {other} for '{key}')"
                )))
            }
        };
        if key == "_id" {
            keep_id = include;
            continue;
        }
        match mode {
            None => mode = Some(include),
            Some(m) if m != include => {
                return Err(FeatherError::InvalidProjection(
                    "cannot mix inclusions and exclusions in a projection".to_string(),
                ))
            }
            _ => {}
        }
        paths.push(key);
    }

    let mut out = match mode {
        // Only the _id switch was given.
        None => doc.clone(),
        Some(true) => {
            let mut acc = Value::object();
            for path in &paths {
                let parts: Vec<&str> = path.split('.').collect();
                if let Some(picked) = pick(doc, &parts) {
                    merge(&mut acc, picked);
                }
            }
            prune_empty_array_elements(&mut acc);
            acc
        }
        Some(false) => {
            let mut copy = doc.clone();
            for path in &paths {
                let parts: Vec<&str> = path.split('.').collect();
                remove_path(&mut copy, &parts);
            }
            copy
        }
    };

    if let Some(out_map) = out.as_object_mut() {
        if keep_id {
            if let Some(id) = doc.get("_id") {
                out_map.insert("_id".to_string(), id.clone());
            }
        } else {
            out_map.remove("_id");
        }
    }
    Ok(out)
}

/// Extract the subdocument holding `parts` from `value`. Arrays propagate
/// element-wise; elements without the path become empty-map placeholders so
/// merges stay index-aligned.
fn pick(value: &Value, parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return Some(value.clone());
    }
    match value {
        Value::Object(map) => map.get(parts[0]).and_then(|child| pick(child, &parts[1..])).map(
            |picked| {
                let mut m = Map::new();
                m.insert(parts[0].to_string(), picked);
                Value::Object(m)
            },
        ),
        Value::Array(arr) => Some(Value::Array(
            arr.iter()
                .map(|el| pick(el, parts).unwrap_or_else(Value::object))
                .collect(),
        )),
        _ => None,
    }
}

/// Recursive structural union of two picked subdocuments.
fn merge(acc: &mut Value, add: Value) {
    match (&mut *acc, add) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        a.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for (index, value) in b.into_iter().enumerate() {
                if index < a.len() {
                    merge(&mut a[index], value);
                } else {
                    a.push(value);
                }
            }
        }
        _ => {}
    }
}

/// Drop the empty-map placeholders left in arrays once all paths are merged.
fn prune_empty_array_elements(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                prune_empty_array_elements(child);
            }
        }
        Value::Array(arr) => {
            for el in arr.iter_mut() {
                prune_empty_array_elements(el);
            }
            arr.retain(|el| !matches!(el, Value::Object(m) if m.is_empty()));
        }
        _ => {}
    }
}

/// Remove `parts` from `value`, descending element-wise through arrays.
fn remove_path(value: &mut Value, parts: &[&str]) {
    match value {
        Value::Object(map) => {
            if parts.len() == 1 {
                map.remove(parts[0]);
            } else if let Some(child) = map.get_mut(parts[0]) {
                remove_path(child, &parts[1..]);
            }
        }
        Value::Array(arr) => {
            for el in arr.iter_mut() {
                remove_path(el, parts);
            }
        }
        _ => {}
    }
}
