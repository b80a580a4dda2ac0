// src/update.rs
//! Update engine.
//!
//! [`modify`] computes a new document from an old one plus an update, which
//! is either a replacement document (no `$`-prefixed top-level key) or a set
//! of modifiers (all top-level keys `$`-prefixed). Modifiers dispatch through
//! a registry of last-step functions; path navigation creates intermediate
//! maps for every modifier except `$unset`.
//!
//! A `$` path component resolves against the triggering query to the indexes
//! of array elements that individually satisfy it, and the modifier is
//! applied at exactly those indexes.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::compare::compare_things;
use crate::document::{check_object, resolve, Map, Value};
use crate::error::{FeatherError, Result};
use crate::query::{match_query, match_query_part, match_value};

/// Apply `update` to `doc`, producing the new document. `query` is the match
/// that selected `doc`; it is only consulted by the positional `$` operator.
pub fn modify(doc: &Value, update: &Value, query: Option<&Value>) -> Result<Value> {
    let update_map = update
        .as_object()
        .ok_or_else(|| FeatherError::InvalidUpdate("an update must be a document".to_string()))?;
    let dollar_count = update_map.keys().filter(|k| k.starts_with('$')).count();
    if dollar_count > 0 && dollar_count != update_map.len() {
        return Err(FeatherError::InvalidUpdate(
            "cannot mix modifiers and plain fields in an update".to_string(),
        ));
    }

    let new_doc = if dollar_count == 0 {
        replace(doc, update)?
    } else {
        apply_modifiers(doc, update_map, query)?
    };

    if doc.get("_id") != new_doc.get("_id") {
        return Err(FeatherError::ImmutableId);
    }
    check_object(&new_doc)?;
    Ok(new_doc)
}

fn replace(doc: &Value, update: &Value) -> Result<Value> {
    if let (Some(old_id), Some(new_id)) = (doc.get("_id"), update.get("_id")) {
        if old_id != new_id {
            return Err(FeatherError::ImmutableId);
        }
    }
    let mut new_doc = update.clone();
    if let Some(id) = doc.get("_id") {
        if let Some(map) = new_doc.as_object_mut() {
            map.insert("_id".to_string(), id.clone());
        }
    }
    Ok(new_doc)
}

fn apply_modifiers(doc: &Value, update_map: &Map, query: Option<&Value>) -> Result<Value> {
    let mut new_doc = doc.clone();
    for (op, operand) in update_map {
        let modifier = MODIFIERS.get(op.as_str()).ok_or_else(|| {
            FeatherError::InvalidUpdate(format!("unknown modifier {op}"))
        })?;
        let fields = operand.as_object().ok_or_else(|| {
            FeatherError::InvalidUpdate(format!("{op} expects a document of field/value pairs"))
        })?;
        for (path, value) in fields {
            for concrete_path in expand_positional(doc, path, query)? {
                apply_at_path(modifier, &mut new_doc, &concrete_path, value)?;
            }
        }
    }
    Ok(new_doc)
}

// ============================================================================
// POSITIONAL `$`
// ============================================================================

/// Expand a path containing the positional `$` component into zero or more
/// concrete paths. Positional resolution happens against the pre-update
/// document.
fn expand_positional(doc: &Value, path: &str, query: Option<&Value>) -> Result<Vec<String>> {
    let mut parts: Vec<String> = path.split('.').map(str::to_string).collect();
    let positions: Vec<usize> = parts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.as_str() == "$")
        .map(|(i, _)| i)
        .collect();
    match positions.len() {
        0 => return Ok(vec![path.to_string()]),
        1 => {}
        _ => {
            return Err(FeatherError::InvalidUpdate(
                "only one positional $ is allowed per path".to_string(),
            ))
        }
    }
    let pos = positions[0];
    if pos == 0 {
        return Err(FeatherError::InvalidUpdate(
            "the positional $ cannot be the first path component".to_string(),
        ));
    }
    let query = query.ok_or_else(|| {
        FeatherError::InvalidUpdate(
            "the positional $ requires the matching query".to_string(),
        )
    })?;
    let query_map = query.as_object().ok_or_else(|| {
        FeatherError::InvalidUpdate("the matching query must be a document".to_string())
    })?;

    let prefix = parts[..pos].join(".");
    let array = match resolve(doc, &prefix).into_value() {
        Some(Value::Array(arr)) => arr,
        _ => {
            return Err(FeatherError::InvalidUpdate(format!(
                "the positional $ requires '{prefix}' to be an array"
            )))
        }
    };

    // Query constraints that talk about this array: the whole field, or a
    // sub-path of its elements.
    let element_prefix = format!("{prefix}.");
    let mut constraints: Vec<(Option<&str>, &Value)> = Vec::new();
    for (key, qv) in query_map {
        if key == &prefix {
            constraints.push((None, qv));
        } else if let Some(rest) = key.strip_prefix(&element_prefix) {
            constraints.push((Some(rest), qv));
        }
    }
    if constraints.is_empty() {
        return Err(FeatherError::InvalidUpdate(format!(
            "the matching query does not constrain the array '{prefix}'"
        )));
    }

    let mut expanded = Vec::new();
    for (index, element) in array.iter().enumerate() {
        let mut selected = true;
        for (rest, qv) in &constraints {
            let hit = match rest {
                None => match_value(Some(element), qv)?,
                Some(rest) => match_query_part(element, rest, qv, false)?,
            };
            if !hit {
                selected = false;
                break;
            }
        }
        if selected {
            parts[pos] = index.to_string();
            expanded.push(parts.join("."));
        }
    }
    Ok(expanded)
}

// ============================================================================
// PATH NAVIGATION
// ============================================================================

struct Modifier {
    /// Whether missing intermediate maps are created along the path.
    /// `$unset` walks without creating; everything else creates.
    creates_intermediate: bool,
    last_step: fn(&mut Value, &str, &Value) -> Result<()>,
}

fn apply_at_path(modifier: &Modifier, target: &mut Value, path: &str, value: &Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    walk(modifier, target, &parts, value)
}

fn walk(modifier: &Modifier, current: &mut Value, parts: &[&str], value: &Value) -> Result<()> {
    if parts.len() == 1 {
        return (modifier.last_step)(current, parts[0], value);
    }
    let head = parts[0];
    match current {
        Value::Object(map) => {
            if !map.contains_key(head) {
                if !modifier.creates_intermediate {
                    return Ok(());
                }
                map.insert(head.to_string(), Value::object());
            }
            walk(modifier, map.get_mut(head).unwrap(), &parts[1..], value)
        }
        Value::Array(arr) => {
            let index = array_index(head)?;
            match arr.get_mut(index) {
                Some(element) => walk(modifier, element, &parts[1..], value),
                None => {
                    if modifier.creates_intermediate {
                        Err(FeatherError::InvalidUpdate(format!(
                            "array index {index} out of range"
                        )))
                    } else {
                        Ok(())
                    }
                }
            }
        }
        _ => {
            if modifier.creates_intermediate {
                Err(FeatherError::InvalidUpdate(format!(
                    "cannot create field '{head}' inside a non-document value"
                )))
            } else {
                Ok(())
            }
        }
    }
}

fn array_index(key: &str) -> Result<usize> {
    key.parse::<usize>().map_err(|_| {
        FeatherError::InvalidUpdate(format!("cannot address field '{key}' inside an array"))
    })
}

fn read_child(parent: &Value, key: &str) -> Result<Option<Value>> {
    match parent {
        Value::Object(map) => Ok(map.get(key).cloned()),
        Value::Array(arr) => Ok(arr.get(array_index(key)?).cloned()),
        _ => Err(non_document(key)),
    }
}

fn write_child(parent: &mut Value, key: &str, value: Value) -> Result<()> {
    match parent {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let index = array_index(key)?;
            if index < arr.len() {
                arr[index] = value;
                Ok(())
            } else if index == arr.len() {
                arr.push(value);
                Ok(())
            } else {
                Err(FeatherError::InvalidUpdate(format!(
                    "array index {index} out of range"
                )))
            }
        }
        _ => Err(non_document(key)),
    }
}

fn non_document(key: &str) -> FeatherError {
    FeatherError::InvalidUpdate(format!(
        "cannot modify field '{key}' of a non-document value"
    ))
}

// ============================================================================
// LAST-STEP MODIFIERS
// ============================================================================

lazy_static! {
    static ref MODIFIERS: HashMap<&'static str, Modifier> = {
        let mut m = HashMap::new();
        m.insert("$set", Modifier { creates_intermediate: true, last_step: set_last });
        m.insert("$unset", Modifier { creates_intermediate: false, last_step: unset_last });
        m.insert("$inc", Modifier { creates_intermediate: true, last_step: inc_last });
        m.insert("$min", Modifier { creates_intermediate: true, last_step: min_last });
        m.insert("$max", Modifier { creates_intermediate: true, last_step: max_last });
        m.insert("$push", Modifier { creates_intermediate: true, last_step: push_last });
        m.insert("$pushAll", Modifier { creates_intermediate: true, last_step: push_all_last });
        m.insert("$addToSet", Modifier { creates_intermediate: true, last_step: add_to_set_last });
        m.insert("$pop", Modifier { creates_intermediate: true, last_step: pop_last });
        m.insert("$pull", Modifier { creates_intermediate: true, last_step: pull_last });
        m.insert("$pullAll", Modifier { creates_intermediate: true, last_step: pull_all_last });
        m
    };
}

fn set_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    write_child(parent, key, value.clone())
}

fn unset_last(parent: &mut Value, key: &str, _value: &Value) -> Result<()> {
    match parent {
        Value::Object(map) => {
            map.remove(key);
        }
        Value::Array(arr) => {
            // Unsetting an array slot nulls it out instead of shifting.
            if let Ok(index) = key.parse::<usize>() {
                if index < arr.len() {
                    arr[index] = Value::Null;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn inc_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let delta = value.as_f64().ok_or_else(|| {
        FeatherError::InvalidUpdate("$inc requires a number operand".to_string())
    })?;
    match read_child(parent, key)? {
        None => write_child(parent, key, value.clone()),
        Some(Value::Number(n)) => write_child(parent, key, Value::Number(n + delta)),
        Some(_) => Err(FeatherError::InvalidUpdate(
            "cannot $inc a non-number field".to_string(),
        )),
    }
}

fn min_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    match read_child(parent, key)? {
        None => write_child(parent, key, value.clone()),
        Some(current) => {
            if compare_things(Some(value), Some(&current)) == std::cmp::Ordering::Less {
                write_child(parent, key, value.clone())
            } else {
                Ok(())
            }
        }
    }
}

fn max_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    match read_child(parent, key)? {
        None => write_child(parent, key, value.clone()),
        Some(current) => {
            if compare_things(Some(value), Some(&current)) == std::cmp::Ordering::Greater {
                write_child(parent, key, value.clone())
            } else {
                Ok(())
            }
        }
    }
}

/// `$push` operand: either a literal element, or an options document with
/// `$each` (required when any option is present) and an optional `$slice`.
fn parse_push_operand(value: &Value) -> Result<(Vec<Value>, Option<i64>)> {
    let map = match value {
        Value::Object(m) if m.keys().any(|k| k.starts_with('$')) => m,
        _ => return Ok((vec![value.clone()], None)),
    };
    let mut items: Option<Vec<Value>> = None;
    let mut slice: Option<i64> = None;
    for (key, v) in map {
        match key.as_str() {
            "$each" => {
                items = Some(v.as_array().cloned().ok_or_else(|| {
                    FeatherError::InvalidUpdate("$each requires an array".to_string())
                })?);
            }
            "$slice" => {
                let n = match v.as_f64() {
                    Some(n) if n.fract() == 0.0 => n as i64,
                    _ => {
                        return Err(FeatherError::InvalidUpdate(
                            "$slice requires an integer".to_string(),
                        ))
                    }
                };
                slice = Some(n);
            }
            other => {
                return Err(FeatherError::InvalidUpdate(format!(
                    "unknown $push option {other}"
                )))
            }
        }
    }
    let items = items.ok_or_else(|| {
        FeatherError::InvalidUpdate("$slice can only be used alongside $each".to_string())
    })?;
    Ok((items, slice))
}

fn push_items(parent: &mut Value, key: &str, items: Vec<Value>, slice: Option<i64>, op: &str) -> Result<()> {
    let mut arr = match read_child(parent, key)? {
        None => Vec::new(),
        Some(Value::Array(arr)) => arr,
        Some(_) => {
            return Err(FeatherError::InvalidUpdate(format!(
                "can only {op} onto an array"
            )))
        }
    };
    arr.extend(items);
    if let Some(n) = slice {
        if n == 0 {
            arr.clear();
        } else if n > 0 {
            arr.truncate(n as usize);
        } else {
            let keep = (-n) as usize;
            if arr.len() > keep {
                arr.drain(..arr.len() - keep);
            }
        }
    }
    write_child(parent, key, Value::Array(arr))
}

fn push_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let (items, slice) = parse_push_operand(value)?;
    push_items(parent, key, items, slice, "$push")
}

fn push_all_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let items = value.as_array().cloned().ok_or_else(|| {
        FeatherError::InvalidUpdate("$pushAll requires an array".to_string())
    })?;
    push_items(parent, key, items, None, "$pushAll")
}

fn add_to_set_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let items = match value {
        Value::Object(m) if m.contains_key("$each") => {
            if m.len() > 1 {
                return Err(FeatherError::InvalidUpdate(
                    "cannot use another field alongside $each".to_string(),
                ));
            }
            m.get("$each")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| {
                    FeatherError::InvalidUpdate("$each requires an array".to_string())
                })?
        }
        _ => vec![value.clone()],
    };
    let mut arr = match read_child(parent, key)? {
        None => Vec::new(),
        Some(Value::Array(arr)) => arr,
        Some(_) => {
            return Err(FeatherError::InvalidUpdate(
                "can only $addToSet onto an array".to_string(),
            ))
        }
    };
    for item in items {
        if !arr.iter().any(|existing| existing == &item) {
            arr.push(item);
        }
    }
    write_child(parent, key, Value::Array(arr))
}

fn pop_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let mut arr = match read_child(parent, key)? {
        Some(Value::Array(arr)) => arr,
        _ => {
            return Err(FeatherError::InvalidUpdate(
                "can only $pop from an array".to_string(),
            ))
        }
    };
    let n = match value.as_f64() {
        Some(n) if n.fract() == 0.0 => n as i64,
        _ => {
            return Err(FeatherError::InvalidUpdate(
                "$pop requires an integer".to_string(),
            ))
        }
    };
    if n > 0 {
        arr.pop();
    } else if n < 0 && !arr.is_empty() {
        arr.remove(0);
    }
    write_child(parent, key, Value::Array(arr))
}

fn pull_matches(element: &Value, operand: &Value) -> Result<bool> {
    match operand {
        Value::Object(m) if !m.is_empty() => {
            if m.keys().all(|k| k.starts_with('$')) {
                match_value(Some(element), operand)
            } else if element.is_object() {
                match_query(element, operand)
            } else {
                Ok(false)
            }
        }
        _ => Ok(element == operand),
    }
}

fn pull_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let arr = match read_child(parent, key)? {
        Some(Value::Array(arr)) => arr,
        _ => {
            return Err(FeatherError::InvalidUpdate(
                "can only $pull from an array".to_string(),
            ))
        }
    };
    let mut kept = Vec::with_capacity(arr.len());
    for element in arr {
        if !pull_matches(&element, value)? {
            kept.push(element);
        }
    }
    write_child(parent, key, Value::Array(kept))
}

fn pull_all_last(parent: &mut Value, key: &str, value: &Value) -> Result<()> {
    let to_remove = value.as_array().ok_or_else(|| {
        FeatherError::InvalidUpdate("$pullAll requires an array".to_string())
    })?;
    let arr = match read_child(parent, key)? {
        Some(Value::Array(arr)) => arr,
        _ => {
            return Err(FeatherError::InvalidUpdate(
                "can only $pullAll from an array".to_string(),
            ))
        }
    };
    let kept: Vec<Value> = arr
        .into_iter()
        .filter(|el| !to_remove.iter().any(|r| r == el))
        .collect();
    write_child(parent, key, Value::Array(kept))
}

// ============================================================================
// TESTS
// ============================================================================
