// src/document.rs
//! Document model.
//!
//! A document is a [`Value`] tree whose leaves are numbers, strings, booleans,
//! nulls and dates, and whose interior nodes are arrays or string-keyed maps.
//! Documents are serialized one per line in the datafile using a JSON encoding
//! with a `{"$$date": <epoch-ms>}` escape so dates survive the round trip.
//!
//! Field names beginning with `$` are reserved for operators and field names
//! containing `.` are reserved for path notation; [`check_object`] enforces
//! both before anything reaches the datafile.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{FeatherError, Result};

/// Interior map node. `BTreeMap` keeps key order canonical, so structurally
/// equal documents compare equal regardless of insertion order.
pub type Map = BTreeMap<String, Value>;

/// A document or any value inside one.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(Map),
}

impl Value {
    pub fn object() -> Value {
        Value::Object(Map::new())
    }

    /// Build a date value from a millisecond epoch timestamp.
    pub fn date_from_millis(ms: i64) -> Option<Value> {
        Utc.timestamp_millis_opt(ms).single().map(Value::Date)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// True for leaf values that can serve as an index lookup key.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Date(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Top-level map lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|m| m.get(key))
    }

    /// Convert to the JSON representation used on the wire. Dates become the
    /// `{"$$date": ms}` escape; integral numbers are emitted without a
    /// fractional part.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Value::from(*n)
                }
            }
            Value::String(s) => serde_json::Value::from(s.clone()),
            Value::Date(d) => {
                let mut m = serde_json::Map::new();
                m.insert(
                    "$$date".to_string(),
                    serde_json::Value::from(d.timestamp_millis()),
                );
                serde_json::Value::Object(m)
            }
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Rebuild a value from its JSON representation, reconstructing dates from
    /// the `{"$$date": ms}` escape.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(ms) = map.get("$$date").and_then(serde_json::Value::as_i64) {
                        if let Some(date) = Value::date_from_millis(ms) {
                            return date;
                        }
                    }
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(&json)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

// ============================================================================
// SERIALIZATION
// ============================================================================

/// Serialize a document to a single datafile line (no trailing newline).
/// String escaping guarantees the output contains no raw line separator.
pub fn serialize(doc: &Value) -> String {
    doc.to_json().to_string()
}

/// Decode one datafile line back into a document.
pub fn deserialize(line: &str) -> Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(line).map_err(|_| FeatherError::MalformedLine(snippet(line)))?;
    Ok(Value::from_json(&json))
}

fn snippet(line: &str) -> String {
    if line.chars().count() > 80 {
        let mut s: String = line.chars().take(77).collect();
        s.push_str("...");
        s
    } else {
        line.to_string()
    }
}

// ============================================================================
// VALIDATION & COPIES
// ============================================================================

/// Reject any key that begins with `$` or contains `.`, anywhere in the tree.
pub fn check_object(doc: &Value) -> Result<()> {
    match doc {
        Value::Object(map) => {
            for (key, value) in map {
                check_key(key)?;
                check_object(value)?;
            }
            Ok(())
        }
        Value::Array(arr) => {
            for value in arr {
                check_object(value)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.starts_with('$') {
        return Err(FeatherError::InvalidField(format!(
            "field names cannot begin with '$' (got '{key}')"
        )));
    }
    if key.contains('.') {
        return Err(FeatherError::InvalidField(format!(
            "field names cannot contain '.' (got '{key}')"
        )));
    }
    Ok(())
}

/// Recursive copy. With `strict_keys`, keys that begin with `$` or contain
/// `.` are silently dropped; used when a matching query is materialized into
/// a replacement document for an upsert.
pub fn deep_copy(doc: &Value, strict_keys: bool) -> Value {
    if !strict_keys {
        return doc.clone();
    }
    match doc {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with('$') && !k.contains('.'))
                .map(|(k, v)| (k.clone(), deep_copy(v, true)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| deep_copy(v, true)).collect()),
        other => other.clone(),
    }
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Random alphanumeric string from the OS entropy source.
pub fn uid(len: usize) -> String {
    let mut rng = OsRng;
    (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// New document `_id`: 16 alphanumeric characters.
pub fn generate_id() -> String {
    uid(16)
}

/// The `_id` of a document, when present and well-formed.
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

// ============================================================================
// DOTTED-PATH RESOLUTION
// ============================================================================

/// Result of resolving a dotted path against a document.
///
/// Crossing an array with a non-numeric path component spreads the resolution
/// over the array's elements; each element resolves independently and may
/// itself be missing.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedField {
    Missing,
    Present(Value),
    Spread(Vec<ResolvedField>),
}

impl ResolvedField {
    pub fn is_defined(&self) -> bool {
        !matches!(self, ResolvedField::Missing)
    }

    /// Materialize the resolution. Spreads become arrays; elements that
    /// resolved to nothing are dropped.
    pub fn into_value(self) -> Option<Value> {
        match self {
            ResolvedField::Missing => None,
            ResolvedField::Present(v) => Some(v),
            ResolvedField::Spread(list) => Some(Value::Array(
                list.into_iter()
                    .filter_map(ResolvedField::into_value)
                    .collect(),
            )),
        }
    }

    /// Per-element view when the resolution is array-shaped: a plain array
    /// value, or a spread across array elements (where an element may be
    /// missing). `None` for scalar resolutions.
    pub fn element_values(&self) -> Option<Vec<Option<Value>>> {
        match self {
            ResolvedField::Present(Value::Array(arr)) => {
                Some(arr.iter().cloned().map(Some).collect())
            }
            ResolvedField::Spread(list) => {
                Some(list.iter().map(|rf| rf.clone().into_value()).collect())
            }
            _ => None,
        }
    }
}

/// Resolve `path` against `value` using dot notation. Numeric components
/// index into arrays; non-numeric components over an array spread over its
/// elements.
pub fn resolve(value: &Value, path: &str) -> ResolvedField {
    let parts: Vec<&str> = path.split('.').collect();
    resolve_parts(value, &parts)
}

fn resolve_parts(value: &Value, parts: &[&str]) -> ResolvedField {
    if parts.is_empty() {
        return ResolvedField::Present(value.clone());
    }
    match value {
        Value::Object(map) => match map.get(parts[0]) {
            Some(child) => resolve_parts(child, &parts[1..]),
            None => ResolvedField::Missing,
        },
        Value::Array(arr) => {
            if let Ok(index) = parts[0].parse::<usize>() {
                match arr.get(index) {
                    Some(el) => resolve_parts(el, &parts[1..]),
                    None => ResolvedField::Missing,
                }
            } else {
                ResolvedField::Spread(arr.iter().map(|el| resolve_parts(el, parts)).collect())
            }
        }
        _ => ResolvedField::Missing,
    }
}

/// Dotted lookup, materialized. Used by sorting and index key extraction.
pub fn get_dotted(value: &Value, path: &str) -> Option<Value> {
    resolve(value, path).into_value()
}

// ============================================================================
// TESTS
// ============================================================================
