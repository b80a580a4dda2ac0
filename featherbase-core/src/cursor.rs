// src/cursor.rs
//! Chainable query execution.
//!
//! A [`Cursor`] accumulates `sort` / `skip` / `limit` / `projection` and runs
//! the whole pipeline as one executor operation on `exec`. Sort order among
//! equal keys preserves candidate scan order; without a sort, `skip` and
//! `limit` apply during candidate traversal.

use std::sync::Arc;

use crate::compare::compare_things_with;
use crate::datastore::DatastoreCore;
use crate::document::{get_dotted, Value};
use crate::error::Result;
use crate::projection::project;
use crate::query::Query;

/// A sort criterion: dotted path plus direction (`1` ascending, `-1`
/// descending). Criteria apply in slice order.
type SortSpec = Vec<(String, i32)>;

pub struct Cursor {
    core: Arc<DatastoreCore>,
    query: Query,
    sort: Option<SortSpec>,
    skip: Option<usize>,
    limit: Option<usize>,
    projection: Option<Value>,
}

impl Cursor {
    pub(crate) fn new(core: Arc<DatastoreCore>, query: Query) -> Self {
        Cursor {
            core,
            query,
            sort: None,
            skip: None,
            limit: None,
            projection: None,
        }
    }

    pub fn sort(mut self, spec: &[(&str, i32)]) -> Self {
        self.sort = Some(
            spec.iter()
                .map(|(path, dir)| (path.to_string(), *dir))
                .collect(),
        );
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn projection(mut self, spec: impl Into<Value>) -> Self {
        self.projection = Some(spec.into());
        self
    }

    /// Run the query on the executor and return owned result documents.
    pub fn exec(self) -> Result<Vec<Value>> {
        let core = Arc::clone(&self.core);
        core.executor.submit(false, move || {
            let mut inner = self.core.inner.lock();
            let candidates = inner.get_candidates(&self.query)?;
            let string_cmp = inner.compare_strings.clone();
            drop(inner);

            let skip = self.skip.unwrap_or(0);
            let limit = self.limit.unwrap_or(usize::MAX);
            let mut results = Vec::new();

            match &self.sort {
                Some(criteria) => {
                    for doc in candidates {
                        if self.query.matches(&doc)? {
                            results.push(doc);
                        }
                    }
                    // Stable sort: ties keep candidate scan order.
                    results.sort_by(|a, b| {
                        for (path, direction) in criteria {
                            let av = get_dotted(a, path);
                            let bv = get_dotted(b, path);
                            let ord = compare_things_with(
                                av.as_ref(),
                                bv.as_ref(),
                                string_cmp.as_ref(),
                            );
                            if ord != std::cmp::Ordering::Equal {
                                return if *direction < 0 { ord.reverse() } else { ord };
                            }
                        }
                        std::cmp::Ordering::Equal
                    });
                    results = results.into_iter().skip(skip).take(limit).collect();
                }
                None => {
                    let mut skipped = 0;
                    for doc in candidates {
                        if !self.query.matches(&doc)? {
                            continue;
                        }
                        if skipped < skip {
                            skipped += 1;
                            continue;
                        }
                        if results.len() >= limit {
                            break;
                        }
                        results.push(doc);
                    }
                }
            }

            match &self.projection {
                Some(spec) => results.iter().map(|doc| project(doc, spec)).collect(),
                None => Ok(results),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::datastore::{Datastore, DatastoreOptions};
    use crate::document::Value;
    use serde_json::json;

    fn seeded() -> Datastore {
        let db = Datastore::new(DatastoreOptions::in_memory()).unwrap();
        for (age, name) in [(5, "eli"), (57, "ada"), (52, "kay"), (23, "bo"), (89, "sol")] {
            db.insert(json!({"age": age, "name": name})).unwrap();
        }
        db
    }

    fn ages(docs: &[Value]) -> Vec<f64> {
        docs.iter()
            .filter_map(|d| d.get("age").and_then(Value::as_f64))
            .collect()
    }

    #[test]
    fn test_sort_ascending_descending() {
        let db = seeded();
        let docs = db.find(json!({})).sort(&[("age", 1)]).exec().unwrap();
        assert_eq!(ages(&docs), vec![5.0, 23.0, 52.0, 57.0, 89.0]);
        let docs = db.find(json!({})).sort(&[("age", -1)]).exec().unwrap();
        assert_eq!(ages(&docs), vec![89.0, 57.0, 52.0, 23.0, 5.0]);
    }

    #[test]
    fn test_filter_then_sort() {
        let db = seeded();
        let docs = db
            .find(json!({"age": {"$gt": 23}}))
            .sort(&[("age", 1)])
            .exec()
            .unwrap();
        assert_eq!(ages(&docs), vec![52.0, 57.0, 89.0]);
    }

    #[test]
    fn test_skip_limit_after_sort() {
        let db = seeded();
        let docs = db
            .find(json!({}))
            .sort(&[("age", 1)])
            .limit(3)
            .skip(1)
            .exec()
            .unwrap();
        assert_eq!(ages(&docs), vec![23.0, 52.0, 57.0]);
    }

    #[test]
    fn test_skip_limit_without_sort() {
        let db = seeded();
        let docs = db.find(json!({})).skip(2).limit(2).exec().unwrap();
        assert_eq!(docs.len(), 2);
        let all = db.find(json!({})).exec().unwrap();
        assert_eq!(ages(&docs), ages(&all)[2..4].to_vec());
    }

    #[test]
    fn test_multi_key_sort_in_slice_order() {
        let db = Datastore::new(DatastoreOptions::in_memory()).unwrap();
        for (grp, n) in [("b", 1), ("a", 2), ("b", 0), ("a", 1)] {
            db.insert(json!({"grp": grp, "n": n})).unwrap();
        }
        let docs = db
            .find(json!({}))
            .sort(&[("grp", 1), ("n", -1)])
            .exec()
            .unwrap();
        let pairs: Vec<(String, f64)> = docs
            .iter()
            .map(|d| {
                (
                    d.get("grp").and_then(Value::as_str).unwrap().to_string(),
                    d.get("n").and_then(Value::as_f64).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), 2.0),
                ("a".to_string(), 1.0),
                ("b".to_string(), 1.0),
                ("b".to_string(), 0.0),
            ]
        );
    }

    #[test]
    fn test_sort_missing_fields_first() {
        let db = Datastore::new(DatastoreOptions::in_memory()).unwrap();
        db.insert(json!({"n": 1})).unwrap();
        db.insert(json!({"other": true})).unwrap();
        db.insert(json!({"n": 0})).unwrap();
        let docs = db.find(json!({})).sort(&[("n", 1)]).exec().unwrap();
        assert!(docs[0].get("n").is_none());
        assert_eq!(docs[1].get("n"), Some(&Value::Number(0.0)));
    }

    #[test]
    fn test_projection_through_cursor() {
        let db = Datastore::new(DatastoreOptions::in_memory()).unwrap();
        db.insert(json!({"age": 5, "name": "jo", "planet": "B"})).unwrap();
        let docs = db
            .find(json!({}))
            .projection(json!({"age": 1, "name": 1, "_id": 0}))
            .exec()
            .unwrap();
        assert_eq!(docs[0], Value::from(json!({"age": 5, "name": "jo"})));

        let err = db
            .find(json!({}))
            .projection(json!({"age": 1, "name": 0}))
            .exec()
            .unwrap_err();
        assert_eq!(err.kind(), "invalidProjection");
    }

    #[test]
    fn test_invalid_query_surfaces_from_exec() {
        let db = seeded();
        let err = db.find(json!({"age": {"$bogus": 1}})).exec().unwrap_err();
        assert_eq!(err.kind(), "invalidQuery");
    }
}
