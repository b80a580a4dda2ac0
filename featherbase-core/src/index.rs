// src/index.rs
//! Ordered keyed indexes.
//!
//! An [`Index`] maps extracted keys to the `_id`s of the documents sharing
//! that key; the datastore's id-map is the single owner of document bodies
//! and resolves the handles at read time. Keys are vectors of optional
//! values so compound indexes and the `undefined` sentinel fall out of one
//! representation. Batch insert/update are all-or-nothing: any failure
//! reverts the mutations already applied in the same call.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use crate::compare::compare_keys;
use crate::document::{doc_id, resolve, Value};
use crate::error::{FeatherError, Result};

/// Declaration of an index, as accepted by `ensure_index` and recorded in
/// the datafile.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOptions {
    /// Dotted paths; more than one makes the index compound.
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
    /// TTL in seconds, for single-field indexes over date values.
    pub expire_after_seconds: Option<f64>,
}

impl IndexOptions {
    pub fn new(field: impl Into<String>) -> Self {
        IndexOptions {
            fields: vec![field.into()],
            unique: false,
            sparse: false,
            expire_after_seconds: None,
        }
    }

    pub fn compound<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexOptions {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
            sparse: false,
            expire_after_seconds: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn expire_after(mut self, seconds: f64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    /// Index name: the comma-join of its fields.
    pub fn name(&self) -> String {
        self.fields.join(",")
    }
}

/// Extracted index key: one component per indexed field, `None` standing in
/// for an absent value (the `undefined` sentinel, which sorts first).
#[derive(Debug, Clone)]
pub struct IndexKey(Vec<Option<Value>>);

impl IndexKey {
    pub fn atom(value: Option<Value>) -> Self {
        IndexKey(vec![value])
    }

    pub fn from_value(value: &Value) -> Self {
        IndexKey(vec![Some(value.clone())])
    }

    pub fn components(&self) -> &[Option<Value>] {
        &self.0
    }

    fn render(&self) -> String {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|c| match c {
                None => "undefined".to_string(),
                Some(v) => v.to_string(),
            })
            .collect();
        parts.join(",")
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        compare_keys(&self.0, &other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        compare_keys(&self.0, &other.0)
    }
}

/// Ordered map from extracted key to document references, in insertion order
/// per key.
#[derive(Debug, Clone)]
pub struct Index {
    name: String,
    fields: Vec<String>,
    unique: bool,
    sparse: bool,
    tree: BTreeMap<IndexKey, Vec<String>>,
}

impl Index {
    pub fn new(fields: Vec<String>, unique: bool, sparse: bool) -> Self {
        let name = fields.join(",");
        Index {
            name,
            fields,
            unique,
            sparse,
            tree: BTreeMap::new(),
        }
    }

    pub fn from_options(options: &IndexOptions) -> Self {
        Index::new(options.fields.clone(), options.unique, options.sparse)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    /// Keys for one document. `None` means the document is skipped entirely
    /// (sparse index, field absent). A single-field index over an array value
    /// yields one key per distinct element; compound components are never
    /// expanded.
    fn extract_keys(&self, doc: &Value) -> Option<Vec<IndexKey>> {
        if self.fields.len() == 1 {
            match resolve(doc, &self.fields[0]).into_value() {
                None => {
                    if self.sparse {
                        None
                    } else {
                        Some(vec![IndexKey::atom(None)])
                    }
                }
                Some(Value::Array(elements)) => {
                    let mut keys: Vec<IndexKey> = Vec::new();
                    for element in elements {
                        let key = IndexKey::atom(Some(element));
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                    Some(keys)
                }
                Some(value) => Some(vec![IndexKey::atom(Some(value))]),
            }
        } else {
            let components: Vec<Option<Value>> = self
                .fields
                .iter()
                .map(|field| resolve(doc, field).into_value())
                .collect();
            if self.sparse && components.iter().all(Option::is_none) {
                return None;
            }
            Some(vec![IndexKey(components)])
        }
    }

    fn remove_key(&mut self, key: &IndexKey, id: &str) {
        if let Some(ids) = self.tree.get_mut(key) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.tree.remove(key);
            }
        }
    }

    /// Insert one document. Array-valued fields insert under every distinct
    /// element; a uniqueness violation on any of them reverts the ones
    /// already placed.
    pub fn insert(&mut self, doc: &Value) -> Result<()> {
        let keys = match self.extract_keys(doc) {
            Some(keys) => keys,
            None => return Ok(()),
        };
        let id = match doc_id(doc) {
            Some(id) => id.to_string(),
            None => {
                return Err(FeatherError::InvalidField(
                    "cannot index a document without an _id".to_string(),
                ))
            }
        };
        let mut placed: Vec<IndexKey> = Vec::new();
        for key in keys {
            if self.unique && self.tree.get(&key).map(|ids| !ids.is_empty()).unwrap_or(false) {
                for prior in &placed {
                    self.remove_key(prior, &id);
                }
                return Err(FeatherError::UniqueViolated {
                    key: key.render(),
                    index: self.name.clone(),
                });
            }
            self.tree.entry(key.clone()).or_default().push(id.clone());
            placed.push(key);
        }
        Ok(())
    }

    /// Bulk insert, all-or-nothing: a failure removes every document inserted
    /// by this call before returning the error.
    pub fn insert_many(&mut self, docs: &[Value]) -> Result<()> {
        for (i, doc) in docs.iter().enumerate() {
            if let Err(err) = self.insert(doc) {
                for done in &docs[..i] {
                    self.remove(done);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, doc: &Value) {
        let keys = match self.extract_keys(doc) {
            Some(keys) => keys,
            None => return,
        };
        let id = match doc_id(doc) {
            Some(id) => id.to_string(),
            None => return,
        };
        for key in keys {
            self.remove_key(&key, &id);
        }
    }

    pub fn remove_many(&mut self, docs: &[Value]) {
        for doc in docs {
            self.remove(doc);
        }
    }

    /// Replace `old` with `new`. On failure the removal is reverted, leaving
    /// the index unchanged.
    pub fn update(&mut self, old: &Value, new: &Value) -> Result<()> {
        self.remove(old);
        if let Err(err) = self.insert(new) {
            // Re-inserting a document that was just removed cannot violate
            // the constraint it satisfied before.
            let _ = self.insert(old);
            return Err(err);
        }
        Ok(())
    }

    /// Transactional batch update: a failure reverts every pair already
    /// applied, in reverse order.
    pub fn update_many(&mut self, pairs: &[(Value, Value)]) -> Result<()> {
        for (i, (old, new)) in pairs.iter().enumerate() {
            if let Err(err) = self.update(old, new) {
                for (old, new) in pairs[..i].iter().rev() {
                    self.revert_update(old, new);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Exact inverse of [`Index::update`], for callers sequencing updates
    /// across several indexes.
    pub fn revert_update(&mut self, old: &Value, new: &Value) {
        self.remove(new);
        let _ = self.insert(old);
    }

    pub fn revert_update_many(&mut self, pairs: &[(Value, Value)]) {
        for (old, new) in pairs.iter().rev() {
            self.revert_update(old, new);
        }
    }

    /// Ids of the documents whose key equals `key`.
    pub fn get_matching(&self, key: &Value) -> Vec<String> {
        self.tree
            .get(&IndexKey::from_value(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Ids matching any of `keys`, deduplicated in first-seen order.
    pub fn get_matching_many(&self, keys: &[Value]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            for id in self.get_matching(key) {
                if seen.insert(id.clone()) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Range scan in ascending key order. `bounds` is a document carrying
    /// any of `$gt`, `$gte`, `$lt`, `$lte`; other keys are ignored and left
    /// to the matcher.
    pub fn get_between_bounds(&self, bounds: &Value) -> Result<Vec<String>> {
        let map = bounds.as_object().ok_or_else(|| {
            FeatherError::InvalidQuery("range bounds must be a document".to_string())
        })?;
        let mut lower: Bound<IndexKey> = Bound::Unbounded;
        let mut upper: Bound<IndexKey> = Bound::Unbounded;
        for (key, value) in map {
            match key.as_str() {
                "$gt" => lower = Bound::Excluded(IndexKey::from_value(value)),
                "$gte" => lower = Bound::Included(IndexKey::from_value(value)),
                "$lt" => upper = Bound::Excluded(IndexKey::from_value(value)),
                "$lte" => upper = Bound::Included(IndexKey::from_value(value)),
                _ => {}
            }
        }
        // An inverted range is empty, not a panic.
        if let (Some(lo), Some(hi)) = (bound_key(&lower), bound_key(&upper)) {
            match lo.cmp(hi) {
                std::cmp::Ordering::Greater => return Ok(Vec::new()),
                std::cmp::Ordering::Equal => {
                    let closed = matches!(lower, Bound::Included(_))
                        && matches!(upper, Bound::Included(_));
                    if !closed {
                        return Ok(Vec::new());
                    }
                }
                std::cmp::Ordering::Less => {}
            }
        }
        Ok(self
            .tree
            .range((lower, upper))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect())
    }

    /// Every referenced id, in ascending key order, insertion order within a
    /// key.
    pub fn get_all(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for ids in self.tree.values() {
            for id in ids {
                if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
        }
        out
    }

    /// Clear the index.
    pub fn reset(&mut self) {
        self.tree.clear();
    }

    /// Clear and repopulate from `docs`.
    pub fn reset_with(&mut self, docs: &[Value]) -> Result<()> {
        self.reset();
        self.insert_many(docs)
    }
}

fn bound_key<'a>(bound: &'a Bound<IndexKey>) -> Option<&'a IndexKey> {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k),
        Bound::Unbounded => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
