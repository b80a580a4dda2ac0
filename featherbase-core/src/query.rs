// src/query.rs
//! Query matching.
//!
//! A query is a document whose entries are either logical operators (`$and`,
//! `$or`, `$not`) or field expressions (`path: value` / `path: {op: arg}`).
//! Comparison operators dispatch through a registry keyed by operator name.
//!
//! `$where` never appears in the declarative filter: string predicates are
//! rejected, and programmatic predicates are attached to a [`Query`] with
//! [`Query::with_predicate`].

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

use crate::compare::{compare_things, is_truthy};
use crate::document::{resolve, Value};
use crate::error::{FeatherError, Result};

/// Opaque predicate over a whole document, the programmatic form of `$where`.
pub type WherePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A declarative filter plus any number of programmatic predicates. All parts
/// must hold for a document to match.
#[derive(Clone)]
pub struct Query {
    filter: Value,
    predicates: Vec<WherePredicate>,
}

impl Query {
    pub fn new(filter: impl Into<Value>) -> Self {
        Query {
            filter: filter.into(),
            predicates: Vec::new(),
        }
    }

    /// Attach a `$where`-style predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn filter(&self) -> &Value {
        &self.filter
    }

    pub fn matches(&self, doc: &Value) -> Result<bool> {
        if !match_query(doc, &self.filter)? {
            return Ok(false);
        }
        Ok(self.predicates.iter().all(|p| p(doc)))
    }
}

impl Default for Query {
    fn default() -> Self {
        Query::new(Value::object())
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("filter", &self.filter)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl From<Value> for Query {
    fn from(filter: Value) -> Self {
        Query::new(filter)
    }
}

impl From<serde_json::Value> for Query {
    fn from(filter: serde_json::Value) -> Self {
        Query::new(Value::from_json(&filter))
    }
}

// ============================================================================
// REGEX SUPPORT
// ============================================================================

lazy_static! {
    // Compiled patterns are cached; `Regex::new` dominates `$regex` cost
    // otherwise. Key format: "options:pattern".
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(128).unwrap()));
}

fn compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    for flag in options.chars() {
        if !matches!(flag, 'i' | 'm' | 's' | 'x') {
            return Err(FeatherError::InvalidQuery(format!(
                "unsupported $options flag '{flag}'"
            )));
        }
    }
    let cache_key = format!("{options}:{pattern}");
    if let Some(re) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(re.clone());
    }
    let full = if options.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{options}){pattern}")
    };
    let re = Regex::new(&full).map_err(|e| {
        FeatherError::InvalidQuery(format!("invalid $regex pattern '{pattern}': {e}"))
    })?;
    REGEX_CACHE.lock().put(cache_key, re.clone());
    Ok(re)
}

fn regex_match(obj: Option<&Value>, operand: &Value, options: &str) -> Result<bool> {
    let pattern = operand.as_str().ok_or_else(|| {
        FeatherError::InvalidQuery("$regex requires a string pattern".to_string())
    })?;
    let re = compile_regex(pattern, options)?;
    match obj {
        Some(Value::String(s)) => Ok(re.is_match(s)),
        _ => Ok(false),
    }
}

// ============================================================================
// COMPARISON OPERATOR REGISTRY
// ============================================================================

type ComparisonFn = fn(Option<&Value>, &Value) -> Result<bool>;

lazy_static! {
    /// `$regex` is dispatched separately so it can read its `$options`
    /// sibling; everything else goes through this table.
    static ref COMPARISON_OPS: HashMap<&'static str, ComparisonFn> = {
        let mut ops: HashMap<&'static str, ComparisonFn> = HashMap::new();
        ops.insert("$lt", op_lt);
        ops.insert("$lte", op_lte);
        ops.insert("$gt", op_gt);
        ops.insert("$gte", op_gte);
        ops.insert("$eq", op_eq);
        ops.insert("$ne", op_ne);
        ops.insert("$in", op_in);
        ops.insert("$nin", op_nin);
        ops.insert("$exists", op_exists);
        ops.insert("$size", op_size);
        ops.insert("$elemMatch", op_elem_match);
        ops
    };
}

/// Ordered comparisons only apply between two numbers, two strings or two
/// dates; any other pairing is a mismatch, not an error.
fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Date(_), Value::Date(_))
    )
}

fn ordered_op(
    obj: Option<&Value>,
    operand: &Value,
    pred: fn(std::cmp::Ordering) -> bool,
) -> Result<bool> {
    match obj {
        Some(v) if comparable(v, operand) => {
            Ok(pred(compare_things(Some(v), Some(operand))))
        }
        _ => Ok(false),
    }
}

fn op_lt(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    ordered_op(obj, operand, |ord| ord == std::cmp::Ordering::Less)
}

fn op_lte(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    ordered_op(obj, operand, |ord| ord != std::cmp::Ordering::Greater)
}

fn op_gt(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    ordered_op(obj, operand, |ord| ord == std::cmp::Ordering::Greater)
}

fn op_gte(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    ordered_op(obj, operand, |ord| ord != std::cmp::Ordering::Less)
}

fn values_equal(obj: Option<&Value>, operand: &Value) -> bool {
    obj.map(|v| v == operand).unwrap_or(false)
}

fn op_eq(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    Ok(values_equal(obj, operand))
}

fn op_ne(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    Ok(!values_equal(obj, operand))
}

fn op_in(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    let list = operand
        .as_array()
        .ok_or_else(|| FeatherError::InvalidQuery("$in requires an array".to_string()))?;
    match obj {
        Some(v) => Ok(list.iter().any(|candidate| candidate == v)),
        None => Ok(false),
    }
}

fn op_nin(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    let list = operand
        .as_array()
        .ok_or_else(|| FeatherError::InvalidQuery("$nin requires an array".to_string()))?;
    match obj {
        Some(v) => Ok(!list.iter().any(|candidate| candidate == v)),
        None => Ok(true),
    }
}

fn op_exists(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    Ok(obj.is_some() == is_truthy(operand))
}

fn op_size(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    let n = match operand.as_f64() {
        Some(n) if n.fract() == 0.0 => n,
        _ => {
            return Err(FeatherError::InvalidQuery(
                "$size requires an integer".to_string(),
            ))
        }
    };
    match obj {
        Some(Value::Array(arr)) => Ok(n >= 0.0 && arr.len() as f64 == n),
        _ => Ok(false),
    }
}

fn op_elem_match(obj: Option<&Value>, operand: &Value) -> Result<bool> {
    let sub = operand.as_object().ok_or_else(|| {
        FeatherError::InvalidQuery("$elemMatch requires a query document".to_string())
    })?;
    let arr = match obj {
        Some(Value::Array(arr)) => arr,
        _ => return Ok(false),
    };
    // An operator-only sub-query applies to the elements themselves
    // ({$gt: 5}); otherwise each element is matched as a document.
    let operator_form = !sub.is_empty() && sub.keys().all(|k| k.starts_with('$'));
    for element in arr {
        let hit = if operator_form {
            match_value(Some(element), operand)?
        } else {
            match_query(element, operand)?
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

// ============================================================================
// MATCHING
// ============================================================================

/// Match a document against a declarative query.
pub fn match_query(doc: &Value, query: &Value) -> Result<bool> {
    let map = query
        .as_object()
        .ok_or_else(|| FeatherError::InvalidQuery("a query must be a document".to_string()))?;
    for (key, sub) in map {
        if key.starts_with('$') {
            match key.as_str() {
                "$and" | "$or" => {
                    let clauses = sub.as_array().ok_or_else(|| {
                        FeatherError::InvalidQuery(format!("{key} requires an array of queries"))
                    })?;
                    let mut hit = key == "$and";
                    for clause in clauses {
                        let sub_hit = match_query(doc, clause)?;
                        if key == "$and" {
                            hit = hit && sub_hit;
                        } else {
                            hit = hit || sub_hit;
                        }
                    }
                    if !hit {
                        return Ok(false);
                    }
                }
                "$not" => {
                    if match_query(doc, sub)? {
                        return Ok(false);
                    }
                }
                "$where" => {
                    return Err(FeatherError::InvalidQuery(
                        "$where takes a programmatic predicate; attach one with \
                         Query::with_predicate"
                            .to_string(),
                    ));
                }
                _ => {
                    return Err(FeatherError::InvalidQuery(format!(
                        "unknown logical operator {key}"
                    )));
                }
            }
        } else if !match_query_part(doc, key, sub, false)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Operands that address the whole array rather than its elements.
fn is_array_specific_operand(qv: &Value) -> bool {
    match qv {
        Value::Array(_) => true,
        Value::Object(m) => m.iter().any(|(k, v)| match k.as_str() {
            "$size" | "$elemMatch" | "$ne" => true,
            "$eq" => v.is_array(),
            _ => false,
        }),
        _ => false,
    }
}

/// Match one field expression. When the resolved value is array-shaped and
/// the operand is not array-specific, the match is element-wise existential.
pub(crate) fn match_query_part(
    doc: &Value,
    field: &str,
    qv: &Value,
    treat_array_as_value: bool,
) -> Result<bool> {
    let resolved = resolve(doc, field);
    if !treat_array_as_value {
        if let Some(elements) = resolved.element_values() {
            if !is_array_specific_operand(qv) {
                for element in &elements {
                    if match_value(element.as_ref(), qv)? {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
        }
    }
    let owned = resolved.into_value();
    match_value(owned.as_ref(), qv)
}

/// Match a single resolved value (possibly missing) against an operand:
/// either an operator object, every operator of which must hold, or a literal
/// compared by deep equality.
pub(crate) fn match_value(obj: Option<&Value>, qv: &Value) -> Result<bool> {
    if let Value::Object(cond) = qv {
        let dollar_count = cond.keys().filter(|k| k.starts_with('$')).count();
        if dollar_count > 0 {
            if dollar_count != cond.len() {
                return Err(FeatherError::InvalidQuery(
                    "cannot mix operators and fields in a query value".to_string(),
                ));
            }
            if cond.contains_key("$options") && !cond.contains_key("$regex") {
                return Err(FeatherError::InvalidQuery(
                    "$options can only be used alongside $regex".to_string(),
                ));
            }
            for (op, operand) in cond {
                let hit = match op.as_str() {
                    "$options" => true,
                    "$regex" => {
                        let options = match cond.get("$options") {
                            None => "",
                            Some(Value::String(flags)) => flags.as_str(),
                            Some(_) => {
                                return Err(FeatherError::InvalidQuery(
                                    "$options requires a string of flags".to_string(),
                                ))
                            }
                        };
                        regex_match(obj, operand, options)?
                    }
                    name => match COMPARISON_OPS.get(name) {
                        Some(f) => f(obj, operand)?,
                        None => {
                            return Err(FeatherError::InvalidQuery(format!(
                                "unknown comparison operator {name}"
                            )))
                        }
                    },
                };
                if !hit {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    Ok(values_equal(obj, qv))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from_json(&json)
    }

    fn matches(doc: serde_json::Value, query: serde_json::Value) -> bool {
        match_query(&v(doc), &v(query)).unwrap()
    }

    fn match_err(doc: serde_json::Value, query: serde_json::Value) -> FeatherError {
        match_query(&v(doc), &v(query)).unwrap_err()
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert!(matches(json!({"a": 1}), json!({})));
    }

    #[test]
    fn test_simple_equality() {
        assert!(matches(json!({"name": "jo"}), json!({"name": "jo"})));
        assert!(!matches(json!({"name": "jo"}), json!({"name": "bob"})));
        assert!(!matches(json!({"name": "jo"}), json!({"missing": "jo"})));
    }

    #[test]
    fn test_dotted_equality() {
        let doc = json!({"address": {"city": "Lyon", "zip": 69000}});
        assert!(matches(doc.clone(), json!({"address.city": "Lyon"})));
        assert!(!matches(doc, json!({"address.city": "Paris"})));
    }

    #[test]
    fn test_deep_equality_on_subdocuments() {
        let doc = json!({"a": {"b": 1, "c": 2}});
        assert!(matches(doc.clone(), json!({"a": {"b": 1, "c": 2}})));
        assert!(!matches(doc, json!({"a": {"b": 1}})));
    }

    #[test]
    fn test_comparison_operators() {
        let doc = json!({"age": 25});
        assert!(matches(doc.clone(), json!({"age": {"$gt": 23}})));
        assert!(matches(doc.clone(), json!({"age": {"$gte": 25}})));
        assert!(matches(doc.clone(), json!({"age": {"$lt": 30}})));
        assert!(matches(doc.clone(), json!({"age": {"$lte": 25}})));
        assert!(!matches(doc.clone(), json!({"age": {"$gt": 25}})));
        assert!(matches(doc.clone(), json!({"age": {"$gt": 18, "$lt": 30}})));
        assert!(!matches(doc, json!({"age": {"$gt": 18, "$lt": 20}})));
    }

    #[test]
    fn test_comparisons_require_matching_types() {
        assert!(!matches(json!({"age": "25"}), json!({"age": {"$gt": 5}})));
        assert!(!matches(json!({"age": 25}), json!({"age": {"$lt": "30"}})));
        assert!(!matches(json!({"age": true}), json!({"age": {"$gte": 0}})));
    }

    #[test]
    fn test_comparisons_on_dates() {
        let doc = v(json!({"at": {"$$date": 5000}}));
        let early = v(json!({"at": {"$gt": {"$$date": 1000}}}));
        let late = v(json!({"at": {"$gt": {"$$date": 9000}}}));
        assert!(match_query(&doc, &early).unwrap());
        assert!(!match_query(&doc, &late).unwrap());
    }

    #[test]
    fn test_ne_and_absent_fields() {
        assert!(matches(json!({"a": 1}), json!({"b": {"$ne": 2}})));
        assert!(matches(json!({"a": 1}), json!({"a": {"$ne": 2}})));
        assert!(!matches(json!({"a": 2}), json!({"a": {"$ne": 2}})));
    }

    #[test]
    fn test_in_nin() {
        assert!(matches(json!({"c": "nyc"}), json!({"c": {"$in": ["nyc", "la"]}})));
        assert!(!matches(json!({"c": "sf"}), json!({"c": {"$in": ["nyc", "la"]}})));
        assert!(matches(json!({"c": "sf"}), json!({"c": {"$nin": ["nyc", "la"]}})));
        assert!(matches(json!({}), json!({"c": {"$nin": ["nyc"]}})));
        let err = match_err(json!({"c": 1}), json!({"c": {"$in": 5}}));
        assert_eq!(err.kind(), "invalidQuery");
    }

    #[test]
    fn test_exists() {
        assert!(matches(json!({"a": null}), json!({"a": {"$exists": true}})));
        assert!(!matches(json!({"a": 1}), json!({"a": {"$exists": false}})));
        assert!(matches(json!({}), json!({"a": {"$exists": false}})));
        // Truthy non-boolean arguments are accepted.
        assert!(matches(json!({"a": 1}), json!({"a": {"$exists": 1}})));
        assert!(matches(json!({}), json!({"a": {"$exists": 0}})));
    }

    #[test]
    fn test_regex() {
        assert!(matches(json!({"s": "hello"}), json!({"s": {"$regex": "^hel"}})));
        assert!(!matches(json!({"s": "hello"}), json!({"s": {"$regex": "^world"}})));
        assert!(matches(
            json!({"s": "HELLO"}),
            json!({"s": {"$regex": "^hel", "$options": "i"}})
        ));
        // Regexes only apply to strings.
        assert!(!matches(json!({"s": 42}), json!({"s": {"$regex": "4"}})));
        let err = match_err(json!({"s": "x"}), json!({"s": {"$regex": "x", "$options": "z"}}));
        assert_eq!(err.kind(), "invalidQuery");
        let err = match_err(json!({"s": "x"}), json!({"s": {"$options": "i"}}));
        assert_eq!(err.kind(), "invalidQuery");
    }

    #[test]
    fn test_array_existential_semantics() {
        let doc = json!({"tags": ["db", "rust"]});
        assert!(matches(doc.clone(), json!({"tags": "rust"})));
        assert!(!matches(doc.clone(), json!({"tags": "go"})));
        assert!(matches(doc, json!({"tags": {"$in": ["go", "db"]}})));

        let doc = json!({"scores": [3, 9]});
        assert!(matches(doc.clone(), json!({"scores": {"$gt": 5}})));
        assert!(!matches(doc, json!({"scores": {"$gt": 10}})));
    }

    #[test]
    fn test_array_crossing_paths() {
        let doc = json!({"a": {"b": [{"c": 1}, {"c": 2}, {"c": 3}]}});
        assert!(matches(doc.clone(), json!({"a.b.c": 2})));
        assert!(!matches(doc.clone(), json!({"a.b.c": 9})));
        assert!(matches(doc, json!({"a.b.1.c": 2})));
    }

    #[test]
    fn test_whole_array_operands() {
        let doc = json!({"tags": ["a", "b"]});
        // Literal arrays compare whole.
        assert!(matches(doc.clone(), json!({"tags": ["a", "b"]})));
        assert!(!matches(doc.clone(), json!({"tags": ["b", "a"]})));
        assert!(!matches(doc.clone(), json!({"tags": ["a"]})));
        // $eq with an explicit array operand too.
        assert!(matches(doc.clone(), json!({"tags": {"$eq": ["a", "b"]}})));
        // $ne addresses the whole array.
        assert!(matches(doc.clone(), json!({"tags": {"$ne": "a"}})));
        assert!(!matches(doc, json!({"tags": {"$ne": ["a", "b"]}})));
    }

    #[test]
    fn test_size() {
        let doc = json!({"tags": ["a", "b"]});
        assert!(matches(doc.clone(), json!({"tags": {"$size": 2}})));
        assert!(!matches(doc.clone(), json!({"tags": {"$size": 3}})));
        assert!(!matches(json!({"tags": "ab"}), json!({"tags": {"$size": 2}})));
        let err = match_err(doc, json!({"tags": {"$size": 1.5}}));
        assert_eq!(err.kind(), "invalidQuery");
    }

    #[test]
    fn test_elem_match() {
        let doc = json!({"runs": [{"km": 5, "t": 30}, {"km": 10, "t": 55}]});
        assert!(matches(
            doc.clone(),
            json!({"runs": {"$elemMatch": {"km": 10, "t": {"$lt": 60}}}})
        ));
        assert!(!matches(
            doc,
            json!({"runs": {"$elemMatch": {"km": 5, "t": {"$gt": 40}}}})
        ));
        // Operator-only form applies to scalar elements.
        let doc = json!({"scores": [2, 8]});
        assert!(matches(
            doc.clone(),
            json!({"scores": {"$elemMatch": {"$gt": 5}}})
        ));
        assert!(!matches(doc, json!({"scores": {"$elemMatch": {"$gt": 9}}})));
    }

    #[test]
    fn test_logical_operators() {
        let doc = json!({"age": 25, "city": "nyc"});
        assert!(matches(
            doc.clone(),
            json!({"$and": [{"age": {"$gt": 20}}, {"city": "nyc"}]})
        ));
        assert!(matches(
            doc.clone(),
            json!({"$or": [{"city": "la"}, {"city": "nyc"}]})
        ));
        assert!(!matches(
            doc.clone(),
            json!({"$or": [{"city": "la"}, {"age": {"$lt": 20}}]})
        ));
        assert!(matches(doc.clone(), json!({"$not": {"city": "la"}})));
        assert!(!matches(doc.clone(), json!({"$not": {"city": "nyc"}})));
        let err = match_err(doc, json!({"$or": {"city": "la"}}));
        assert_eq!(err.kind(), "invalidQuery");
    }

    #[test]
    fn test_mixed_operator_and_field_rejected() {
        let err = match_err(json!({"a": 1}), json!({"a": {"$gt": 0, "b": 1}}));
        assert_eq!(err.kind(), "invalidQuery");
    }

    #[test]
    fn test_unknown_operators_rejected() {
        assert_eq!(
            match_err(json!({"a": 1}), json!({"a": {"$frob": 1}})).kind(),
            "invalidQuery"
        );
        assert_eq!(
            match_err(json!({"a": 1}), json!({"$xor": []})).kind(),
            "invalidQuery"
        );
    }

    #[test]
    fn test_where_requires_programmatic_predicate() {
        let err = match_err(json!({"a": 1}), json!({"$where": "this.a === 1"}));
        assert_eq!(err.kind(), "invalidQuery");

        let q = Query::new(v(json!({}))).with_predicate(|doc| {
            doc.get("a").and_then(Value::as_f64).map(|n| n > 0.0).unwrap_or(false)
        });
        assert!(q.matches(&v(json!({"a": 1}))).unwrap());
        assert!(!q.matches(&v(json!({"a": -1}))).unwrap());
    }
}
