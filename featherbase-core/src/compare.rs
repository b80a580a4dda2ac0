// src/compare.rs
//! Total order over document values.
//!
//! Cross-type ordering: missing < null < numbers < strings < booleans <
//! dates < arrays < maps. Within a type: numbers and dates numerically,
//! strings through the datastore's configured comparator (lexicographic by
//! default), arrays by lexicographic extension (shorter first on a common
//! prefix), maps by sorted-key element-wise comparison then key count.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::document::Value;

/// Pluggable string comparator, configured per datastore.
pub type StringComparator = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Compare two possibly-missing values with the default string order.
pub fn compare_things(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    compare_things_with(a, b, None)
}

/// Compare two possibly-missing values, strings through `string_cmp` when
/// one is supplied. `None` (a missing field) sorts before everything.
pub fn compare_things_with(
    a: Option<&Value>,
    b: Option<&Value>,
    string_cmp: Option<&StringComparator>,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y, string_cmp),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Bool(_) => 3,
        Value::Date(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare_values(a: &Value, b: &Value, string_cmp: Option<&StringComparator>) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => match string_cmp {
            Some(cmp) => cmp(x, y),
            None => x.cmp(y),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let ord = compare_values(xe, ye, string_cmp);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // BTreeMap iterates in sorted key order already.
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(xv, yv, string_cmp);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compound comparator over key vectors: component-wise, first non-zero wins,
/// then vector length. A missing component sorts first.
pub fn compare_keys(a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
    for (ak, bk) in a.iter().zip(b.iter()) {
        let ord = compare_things(ak.as_ref(), bk.as_ref());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Truthiness of an operator argument (`$exists`, projection flags).
pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from_json(&json)
    }

    #[test]
    fn test_cross_type_chain() {
        let date = Value::date_from_millis(0).unwrap();
        let ladder = [
            v(json!(null)),
            v(json!(3)),
            v(json!("abc")),
            v(json!(true)),
            date,
            v(json!([1, 2])),
            v(json!({"a": 1})),
        ];
        for pair in ladder.windows(2) {
            assert_eq!(
                compare_things(Some(&pair[0]), Some(&pair[1])),
                Ordering::Less,
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
        // A missing value sorts before everything, null included.
        assert_eq!(compare_things(None, Some(&v(json!(null)))), Ordering::Less);
    }

    #[test]
    fn test_numbers_and_dates() {
        assert_eq!(
            compare_things(Some(&v(json!(2))), Some(&v(json!(10)))),
            Ordering::Less
        );
        let early = Value::date_from_millis(1_000).unwrap();
        let late = Value::date_from_millis(2_000).unwrap();
        assert_eq!(compare_things(Some(&early), Some(&late)), Ordering::Less);
        assert_eq!(compare_things(Some(&late), Some(&late)), Ordering::Equal);
    }

    #[test]
    fn test_booleans() {
        assert_eq!(
            compare_things(Some(&v(json!(false))), Some(&v(json!(true)))),
            Ordering::Less
        );
    }

    #[test]
    fn test_arrays_lexicographic() {
        assert_eq!(
            compare_things(Some(&v(json!([1, 2]))), Some(&v(json!([1, 3])))),
            Ordering::Less
        );
        // Shorter is smaller on a common prefix.
        assert_eq!(
            compare_things(Some(&v(json!([1, 2]))), Some(&v(json!([1, 2, 0])))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(Some(&v(json!([]))), Some(&v(json!([0])))),
            Ordering::Less
        );
    }

    #[test]
    fn test_maps_by_sorted_keys_then_count() {
        assert_eq!(
            compare_things(Some(&v(json!({"a": 1}))), Some(&v(json!({"a": 2})))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(Some(&v(json!({"a": 1}))), Some(&v(json!({"b": 0})))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(Some(&v(json!({"a": 1}))), Some(&v(json!({"a": 1, "b": 2})))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(
                Some(&v(json!({"b": 2, "a": 1}))),
                Some(&v(json!({"a": 1, "b": 2})))
            ),
            Ordering::Equal
        );
    }

    #[test]
    fn test_custom_string_comparator() {
        let reverse: StringComparator = Arc::new(|a, b| b.cmp(a));
        assert_eq!(
            compare_things_with(
                Some(&v(json!("a"))),
                Some(&v(json!("b"))),
                Some(&reverse)
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn test_compound_keys() {
        let a = [Some(v(json!("fr"))), Some(v(json!(1)))];
        let b = [Some(v(json!("fr"))), Some(v(json!(2)))];
        let c = [Some(v(json!("us"))), Some(v(json!(0)))];
        assert_eq!(compare_keys(&a, &b), Ordering::Less);
        assert_eq!(compare_keys(&b, &c), Ordering::Less);
        assert_eq!(compare_keys(&a, &a), Ordering::Equal);
        // Missing components sort first.
        let missing = [None, Some(v(json!(99)))];
        assert_eq!(compare_keys(&missing, &a), Ordering::Less);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&v(json!(null))));
        assert!(!is_truthy(&v(json!(false))));
        assert!(!is_truthy(&v(json!(0))));
        assert!(!is_truthy(&v(json!(""))));
        assert!(is_truthy(&v(json!(1))));
        assert!(is_truthy(&v(json!("x"))));
        assert!(is_truthy(&v(json!([]))));
        assert!(is_truthy(&v(json!({}))));
    }
}
