// src/datastore.rs
//! Datastore orchestration.
//!
//! One datastore = one datafile, one id-map owning the document bodies, and
//! N ordered indexes holding `_id` handles. Every public operation is a
//! closure submitted to the executor queue, so mutations are single-writer
//! and reads observe a consistent snapshot. The queue buffers submissions
//! until `load_database` has run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::compare::StringComparator;
use crate::cursor::Cursor;
use crate::document::{
    check_object, deep_copy, doc_id, generate_id, get_dotted, serialize, Value,
};
use crate::error::{FeatherError, Result};
use crate::executor::Executor;
use crate::index::{Index, IndexOptions};
use crate::{log_info, log_warn};
use crate::persistence::{deletion_line, index_created_line, index_removed_line, Persistence};
use crate::query::Query;
use crate::update::modify;

const DEFAULT_CORRUPT_ALERT_THRESHOLD: f64 = 0.1;
const MIN_AUTOCOMPACTION_INTERVAL: Duration = Duration::from_secs(5);

/// Options accepted by [`Datastore::new`].
#[derive(Clone)]
pub struct DatastoreOptions {
    /// Datafile path. `None` means in-memory.
    pub filename: Option<PathBuf>,
    /// Force in-memory operation even when a filename is given.
    pub in_memory_only: bool,
    /// Load the datafile during `new`. When off, operations buffer until
    /// `load_database` is called.
    pub autoload: bool,
    /// Maintain `createdAt` / `updatedAt` on inserts and updates.
    pub timestamp_data: bool,
    /// Fraction of unreadable datafile lines tolerated at load.
    pub corrupt_alert_threshold: f64,
    /// String comparator used by sorts; lexicographic when absent.
    pub compare_strings: Option<StringComparator>,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        DatastoreOptions {
            filename: None,
            in_memory_only: false,
            autoload: true,
            timestamp_data: false,
            corrupt_alert_threshold: DEFAULT_CORRUPT_ALERT_THRESHOLD,
            compare_strings: None,
        }
    }
}

impl DatastoreOptions {
    pub fn in_memory() -> Self {
        DatastoreOptions::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        DatastoreOptions {
            filename: Some(path.into()),
            ..DatastoreOptions::default()
        }
    }
}

impl fmt::Debug for DatastoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreOptions")
            .field("filename", &self.filename)
            .field("in_memory_only", &self.in_memory_only)
            .field("autoload", &self.autoload)
            .field("timestamp_data", &self.timestamp_data)
            .field("corrupt_alert_threshold", &self.corrupt_alert_threshold)
            .field("compare_strings", &self.compare_strings.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
    pub return_updated_docs: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub multi: bool,
}

/// Result of [`Datastore::update`].
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub num_affected: usize,
    pub upsert: bool,
    /// The post-update documents, when `return_updated_docs` was set.
    pub docs: Option<Vec<Value>>,
}

struct AutocompactionHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

pub(crate) struct DatastoreCore {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) executor: Executor,
    autocompaction: Mutex<Option<AutocompactionHandle>>,
}

/// An embedded document collection.
pub struct Datastore {
    core: Arc<DatastoreCore>,
}

// ============================================================================
// GUARDED STATE
// ============================================================================

/// The single-owner state behind the executor. All mutation happens through
/// `&mut self` methods invoked from queued operations.
pub(crate) struct Inner {
    persistence: Persistence,
    /// The id-map: sole owner of document bodies. Indexes hold `_id` handles
    /// resolved through this map at read time.
    docs: HashMap<String, Value>,
    /// All indexes, `_id` always included.
    indexes: BTreeMap<String, Index>,
    /// TTL seconds per index name.
    ttl: HashMap<String, f64>,
    timestamp_data: bool,
    pub(crate) compare_strings: Option<StringComparator>,
    corruption: Option<(usize, usize, f64)>,
}

impl Inner {
    fn new(options: &DatastoreOptions) -> Self {
        let in_memory = options.in_memory_only || options.filename.is_none();
        let filename = if in_memory {
            None
        } else {
            options.filename.clone()
        };
        let mut indexes = BTreeMap::new();
        indexes.insert("_id".to_string(), id_index());
        Inner {
            persistence: Persistence::new(filename, options.corrupt_alert_threshold),
            docs: HashMap::new(),
            indexes,
            ttl: HashMap::new(),
            timestamp_data: options.timestamp_data,
            compare_strings: options.compare_strings.clone(),
            corruption: None,
        }
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if let Some((corrupt, total, threshold)) = self.corruption {
            return Err(FeatherError::LoadCorrupted {
                corrupt,
                total,
                threshold,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Load & compaction
    // ------------------------------------------------------------------

    pub(crate) fn load_database(&mut self) -> Result<()> {
        let loaded = match self.persistence.load() {
            Ok(loaded) => loaded,
            Err(FeatherError::LoadCorrupted {
                corrupt,
                total,
                threshold,
            }) => {
                self.corruption = Some((corrupt, total, threshold));
                return Err(FeatherError::LoadCorrupted {
                    corrupt,
                    total,
                    threshold,
                });
            }
            Err(other) => return Err(other),
        };

        self.corruption = None;
        self.docs = loaded.documents;
        self.indexes.clear();
        self.ttl.clear();
        self.indexes.insert("_id".to_string(), id_index());
        for options in &loaded.indexes {
            let name = options.name();
            if name == "_id" || self.indexes.contains_key(&name) {
                continue;
            }
            self.indexes.insert(name.clone(), Index::from_options(options));
            if let Some(seconds) = options.expire_after_seconds {
                if options.fields.len() == 1 {
                    self.ttl.insert(name, seconds);
                }
            }
        }

        if let Err(err) = self.rebuild_indexes() {
            // A declared constraint does not hold over the folded data; do
            // not leave half-built state behind.
            self.docs.clear();
            for index in self.indexes.values_mut() {
                index.reset();
            }
            return Err(err);
        }

        self.sweep_expired();
        self.persist_cached_database()?;
        log_info!(
            "loaded {} documents and {} secondary indexes from the datafile",
            self.docs.len(),
            self.indexes.len() - 1
        );
        Ok(())
    }

    fn rebuild_indexes(&mut self) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.reset();
        }
        for doc in self.docs.values() {
            for index in self.indexes.values_mut() {
                index.insert(doc)?;
            }
        }
        Ok(())
    }

    /// Remove every expired TTL document from memory. Used right before a
    /// snapshot write, which makes deletion records unnecessary.
    fn sweep_expired(&mut self) {
        let expired: Vec<String> = self
            .docs
            .values()
            .filter(|doc| self.is_expired(doc))
            .filter_map(|doc| doc_id(doc).map(str::to_string))
            .collect();
        for id in expired {
            if let Some(doc) = self.docs.remove(&id) {
                for index in self.indexes.values_mut() {
                    index.remove(&doc);
                }
            }
        }
    }

    fn is_expired(&self, doc: &Value) -> bool {
        if self.ttl.is_empty() {
            return false;
        }
        let now_ms = Utc::now().timestamp_millis();
        for (name, seconds) in &self.ttl {
            let field = match self.indexes.get(name) {
                Some(index) => &index.fields()[0],
                None => continue,
            };
            // Only date values expire; anything else is skipped.
            if let Some(Value::Date(stamp)) = get_dotted(doc, field) {
                if (now_ms - stamp.timestamp_millis()) as f64 > seconds * 1000.0 {
                    return true;
                }
            }
        }
        false
    }

    /// Write a compacted snapshot: all live documents in `_id` order plus
    /// every index declaration.
    fn persist_cached_database(&self) -> Result<()> {
        let mut lines = Vec::with_capacity(self.docs.len() + self.indexes.len());
        for id in self.id_order() {
            if let Some(doc) = self.docs.get(&id) {
                lines.push(serialize(doc));
            }
        }
        for (name, index) in &self.indexes {
            if name == "_id" {
                continue;
            }
            let options = IndexOptions {
                fields: index.fields().to_vec(),
                unique: index.is_unique(),
                sparse: index.is_sparse(),
                expire_after_seconds: self.ttl.get(name).copied(),
            };
            lines.push(index_created_line(&options));
        }
        self.persistence.persist_cached_database(&lines)
    }

    pub(crate) fn compact(&mut self) -> Result<()> {
        self.ensure_ready()?;
        // The periodic sweep rides along with compaction.
        self.sweep_expired();
        self.persist_cached_database()
    }

    // ------------------------------------------------------------------
    // Index staging
    // ------------------------------------------------------------------

    fn add_to_indexes(&mut self, docs: &[Value]) -> Result<()> {
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for (i, name) in names.iter().enumerate() {
            if let Err(err) = self.indexes.get_mut(name).unwrap().insert_many(docs) {
                for prior in &names[..i] {
                    self.indexes.get_mut(prior).unwrap().remove_many(docs);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn remove_from_indexes(&mut self, docs: &[Value]) {
        for index in self.indexes.values_mut() {
            index.remove_many(docs);
        }
    }

    fn update_indexes(&mut self, pairs: &[(Value, Value)]) -> Result<()> {
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for (i, name) in names.iter().enumerate() {
            if let Err(err) = self.indexes.get_mut(name).unwrap().update_many(pairs) {
                for prior in &names[..i] {
                    self.indexes.get_mut(prior).unwrap().revert_update_many(pairs);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Candidate selection
    // ------------------------------------------------------------------

    fn id_order(&self) -> Vec<String> {
        self.indexes
            .get("_id")
            .map(Index::get_all)
            .unwrap_or_default()
    }

    /// Pick candidate ids for a query: an equality predicate over an indexed
    /// field first, then `$in`, then a comparison range, else a full scan in
    /// `_id` order. A candidate set as large as the collection degrades to
    /// the full scan.
    fn candidate_ids(&self, filter: &Value) -> Result<Vec<String>> {
        let map = match filter.as_object() {
            Some(map) => map,
            None => return Ok(self.id_order()),
        };
        for (key, value) in map {
            if key.starts_with('$') || !value.is_primitive() {
                continue;
            }
            if let Some(index) = self.indexes.get(key) {
                return Ok(self.bounded(index.get_matching(value)));
            }
        }
        for (key, value) in map {
            if key.starts_with('$') {
                continue;
            }
            if let (Some(operand), Some(index)) = (value.get("$in"), self.indexes.get(key)) {
                if let Value::Array(keys) = operand {
                    return Ok(self.bounded(index.get_matching_many(keys)));
                }
            }
        }
        for (key, value) in map {
            if key.starts_with('$') {
                continue;
            }
            let has_bounds = value
                .as_object()
                .map(|m| {
                    m.keys()
                        .any(|k| matches!(k.as_str(), "$lt" | "$lte" | "$gt" | "$gte"))
                })
                .unwrap_or(false);
            if has_bounds {
                if let Some(index) = self.indexes.get(key) {
                    return Ok(self.bounded(index.get_between_bounds(value)?));
                }
            }
        }
        Ok(self.id_order())
    }

    fn bounded(&self, ids: Vec<String>) -> Vec<String> {
        if ids.len() >= self.docs.len() {
            self.id_order()
        } else {
            ids
        }
    }

    /// Candidate documents for a query, with lazy TTL expiry: expired
    /// candidates are deleted (with deletion records) instead of returned.
    pub(crate) fn get_candidates(&mut self, query: &Query) -> Result<Vec<Value>> {
        self.ensure_ready()?;
        let ids = self.candidate_ids(query.filter())?;
        let mut fresh = Vec::new();
        let mut expired = Vec::new();
        for id in ids {
            if let Some(doc) = self.docs.get(&id) {
                if self.is_expired(doc) {
                    expired.push(doc.clone());
                } else {
                    fresh.push(doc.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut lines = Vec::with_capacity(expired.len());
            for doc in &expired {
                for index in self.indexes.values_mut() {
                    index.remove(doc);
                }
                if let Some(id) = doc_id(doc) {
                    self.docs.remove(id);
                    lines.push(deletion_line(id));
                }
            }
            self.persistence.append_lines(&lines)?;
        }
        Ok(fresh)
    }

    pub(crate) fn count_docs(&mut self, query: &Query) -> Result<usize> {
        let candidates = self.get_candidates(query)?;
        let mut count = 0;
        for doc in &candidates {
            if query.matches(doc)? {
                count += 1;
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn fresh_id(&self) -> String {
        loop {
            let id = generate_id();
            if !self.docs.contains_key(&id) {
                return id;
            }
        }
    }

    fn prepare_for_insert(&self, mut doc: Value) -> Result<Value> {
        if !doc.is_object() {
            return Err(FeatherError::InvalidField(
                "a document must be a map of fields".to_string(),
            ));
        }
        match doc.get("_id") {
            None => {
                let id = self.fresh_id();
                doc.as_object_mut()
                    .unwrap()
                    .insert("_id".to_string(), Value::String(id));
            }
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(FeatherError::InvalidField(
                    "the _id field must be a string".to_string(),
                ))
            }
        }
        if self.timestamp_data {
            let now = Value::Date(Utc::now());
            let map = doc.as_object_mut().unwrap();
            map.entry("createdAt".to_string()).or_insert_with(|| now.clone());
            map.entry("updatedAt".to_string()).or_insert(now);
        }
        check_object(&doc)?;
        Ok(doc)
    }

    pub(crate) fn insert_docs(&mut self, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.ensure_ready()?;
        let mut prepared = Vec::with_capacity(docs.len());
        for doc in docs {
            prepared.push(self.prepare_for_insert(doc)?);
        }
        self.add_to_indexes(&prepared)?;
        for doc in &prepared {
            if let Some(id) = doc_id(doc) {
                self.docs.insert(id.to_string(), doc.clone());
            }
        }
        let lines: Vec<String> = prepared.iter().map(serialize).collect();
        if let Err(err) = self.persistence.append_lines(&lines) {
            self.remove_from_indexes(&prepared);
            for doc in &prepared {
                if let Some(id) = doc_id(doc) {
                    self.docs.remove(id);
                }
            }
            return Err(err);
        }
        Ok(prepared)
    }

    pub(crate) fn update_docs(
        &mut self,
        query: &Query,
        update: &Value,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        self.ensure_ready()?;
        let candidates = self.get_candidates(query)?;
        let mut matched = Vec::new();
        for doc in candidates {
            if query.matches(&doc)? {
                matched.push(doc);
                if !options.multi {
                    break;
                }
            }
        }

        if matched.is_empty() {
            if !options.upsert {
                return Ok(UpdateOutcome {
                    num_affected: 0,
                    upsert: false,
                    docs: options.return_updated_docs.then(Vec::new),
                });
            }
            // Materialize a document from the update: the replacement itself,
            // or the query's plain fields run through the modifiers.
            let update_map = update.as_object().ok_or_else(|| {
                FeatherError::InvalidUpdate("an update must be a document".to_string())
            })?;
            let has_modifiers = update_map.keys().any(|k| k.starts_with('$'));
            let to_insert = if has_modifiers {
                let base = deep_copy(query.filter(), true);
                modify(&base, update, Some(query.filter()))?
            } else {
                update.clone()
            };
            let inserted = self.insert_docs(vec![to_insert])?;
            return Ok(UpdateOutcome {
                num_affected: 1,
                upsert: true,
                docs: options.return_updated_docs.then_some(inserted),
            });
        }

        let now = Utc::now();
        let mut pairs = Vec::with_capacity(matched.len());
        for old in matched {
            let mut new_doc = modify(&old, update, Some(query.filter()))?;
            if self.timestamp_data {
                if let Some(map) = new_doc.as_object_mut() {
                    if let Some(created) = old.get("createdAt") {
                        map.insert("createdAt".to_string(), created.clone());
                    }
                    map.insert("updatedAt".to_string(), Value::Date(now));
                }
            }
            pairs.push((old, new_doc));
        }

        self.update_indexes(&pairs)?;
        for (_, new_doc) in &pairs {
            if let Some(id) = doc_id(new_doc) {
                self.docs.insert(id.to_string(), new_doc.clone());
            }
        }
        let lines: Vec<String> = pairs.iter().map(|(_, new_doc)| serialize(new_doc)).collect();
        if let Err(err) = self.persistence.append_lines(&lines) {
            for index in self.indexes.values_mut() {
                index.revert_update_many(&pairs);
            }
            for (old, _) in &pairs {
                if let Some(id) = doc_id(old) {
                    self.docs.insert(id.to_string(), old.clone());
                }
            }
            return Err(err);
        }
        Ok(UpdateOutcome {
            num_affected: pairs.len(),
            upsert: false,
            docs: options
                .return_updated_docs
                .then(|| pairs.iter().map(|(_, new_doc)| new_doc.clone()).collect()),
        })
    }

    pub(crate) fn remove_docs(&mut self, query: &Query, options: &RemoveOptions) -> Result<usize> {
        self.ensure_ready()?;
        let candidates = self.get_candidates(query)?;
        let mut removed = Vec::new();
        for doc in candidates {
            if query.matches(&doc)? {
                removed.push(doc);
                if !options.multi {
                    break;
                }
            }
        }
        let mut lines = Vec::with_capacity(removed.len());
        for doc in &removed {
            for index in self.indexes.values_mut() {
                index.remove(doc);
            }
            if let Some(id) = doc_id(doc) {
                self.docs.remove(id);
                lines.push(deletion_line(id));
            }
        }
        if let Err(err) = self.persistence.append_lines(&lines) {
            for doc in &removed {
                for index in self.indexes.values_mut() {
                    let _ = index.insert(doc);
                }
                if let Some(id) = doc_id(doc) {
                    self.docs.insert(id.to_string(), doc.clone());
                }
            }
            return Err(err);
        }
        Ok(removed.len())
    }

    // ------------------------------------------------------------------
    // Index management
    // ------------------------------------------------------------------

    pub(crate) fn ensure_index(&mut self, options: &IndexOptions) -> Result<()> {
        self.ensure_ready()?;
        if options.fields.is_empty() || options.fields.iter().any(String::is_empty) {
            return Err(FeatherError::InvalidField(
                "cannot create an index without a field name".to_string(),
            ));
        }
        let name = options.name();
        if self.indexes.contains_key(&name) {
            // Idempotent: the index already exists.
            return Ok(());
        }
        let mut index = Index::from_options(options);
        for doc in self.docs.values() {
            index.insert(doc)?;
        }
        self.indexes.insert(name.clone(), index);
        if let Some(seconds) = options.expire_after_seconds {
            if options.fields.len() == 1 {
                self.ttl.insert(name.clone(), seconds);
            }
        }
        if let Err(err) = self
            .persistence
            .append_lines(&[index_created_line(options)])
        {
            self.indexes.remove(&name);
            self.ttl.remove(&name);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn remove_index(&mut self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        if name == "_id" {
            return Err(FeatherError::InvalidField(
                "the _id index cannot be removed".to_string(),
            ));
        }
        self.indexes.remove(name);
        self.ttl.remove(name);
        self.persistence
            .append_lines(&[index_removed_line(name)])
    }

    pub(crate) fn all_docs(&self) -> Result<Vec<Value>> {
        self.ensure_ready()?;
        Ok(self
            .id_order()
            .into_iter()
            .filter_map(|id| self.docs.get(&id).cloned())
            .collect())
    }
}

fn id_index() -> Index {
    Index::new(vec!["_id".to_string()], true, false)
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

impl Datastore {
    /// Open a datastore. With `autoload` (the default) or an in-memory
    /// configuration the datafile is loaded before this returns; otherwise
    /// operations buffer until [`Datastore::load_database`].
    pub fn new(options: DatastoreOptions) -> Result<Datastore> {
        let in_memory = options.in_memory_only || options.filename.is_none();
        let datastore = Datastore {
            core: Arc::new(DatastoreCore {
                inner: Mutex::new(Inner::new(&options)),
                executor: Executor::new(),
                autocompaction: Mutex::new(None),
            }),
        };
        if options.autoload || in_memory {
            datastore.load_database()?;
        }
        Ok(datastore)
    }

    /// Read the datafile, fold its events, rebuild indexes, prune expired
    /// documents, write a compacted snapshot, then release buffered
    /// operations. After a corruption failure the datastore refuses all
    /// operations.
    pub fn load_database(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let result = self
            .core
            .executor
            .submit(true, move || core.inner.lock().load_database());
        // Buffered operations drain either way; after a failed load each one
        // reports the corruption instead of blocking forever.
        self.core.executor.process_buffer();
        result
    }

    fn submit<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut Inner) -> R + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        self.core
            .executor
            .submit(false, move || f(&mut core.inner.lock()))
    }

    /// Insert one document; returns the stored copy with its `_id`.
    pub fn insert(&self, doc: impl Into<Value>) -> Result<Value> {
        let mut inserted = self.insert_many(vec![doc.into()])?;
        Ok(inserted.remove(0))
    }

    /// Atomic multi-insert: on any failure no document is inserted.
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.submit(move |inner| inner.insert_docs(docs))
    }

    /// Start a chainable query.
    pub fn find(&self, query: impl Into<Query>) -> Cursor {
        Cursor::new(Arc::clone(&self.core), query.into())
    }

    pub fn find_all(&self, query: impl Into<Query>) -> Result<Vec<Value>> {
        self.find(query).exec()
    }

    pub fn find_one(&self, query: impl Into<Query>) -> Result<Option<Value>> {
        Ok(self.find(query).limit(1).exec()?.pop())
    }

    pub fn count(&self, query: impl Into<Query>) -> Result<usize> {
        let query = query.into();
        self.submit(move |inner| inner.count_docs(&query))
    }

    pub fn update(
        &self,
        query: impl Into<Query>,
        update: impl Into<Value>,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let query = query.into();
        let update = update.into();
        self.submit(move |inner| inner.update_docs(&query, &update, &options))
    }

    pub fn remove(&self, query: impl Into<Query>, options: RemoveOptions) -> Result<usize> {
        let query = query.into();
        self.submit(move |inner| inner.remove_docs(&query, &options))
    }

    /// Create an index over current and future documents. Idempotent when an
    /// index with the same fields already exists.
    pub fn ensure_index(&self, options: IndexOptions) -> Result<()> {
        self.submit(move |inner| inner.ensure_index(&options))
    }

    pub fn remove_index(&self, field_name: &str) -> Result<()> {
        let name = field_name.to_string();
        self.submit(move |inner| inner.remove_index(&name))
    }

    /// Candidate documents for a query, after index selection but before
    /// matching.
    pub fn get_candidates(&self, query: impl Into<Query>) -> Result<Vec<Value>> {
        let query = query.into();
        self.submit(move |inner| inner.get_candidates(&query))
    }

    /// Every document, in `_id` order.
    pub fn get_all_data(&self) -> Result<Vec<Value>> {
        self.submit(|inner| inner.all_docs())
    }

    /// Rewrite the datafile as a compacted snapshot.
    pub fn compact_datafile(&self) -> Result<()> {
        self.submit(|inner| inner.compact())
    }

    /// Re-run compaction (which also sweeps expired TTL documents) on a
    /// timer. Intervals shorter than five seconds are raised to five.
    pub fn set_autocompaction_interval(&self, interval: Duration) {
        self.stop_autocompaction();
        let interval = interval.max(MIN_AUTOCOMPACTION_INTERVAL);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let weak = Arc::downgrade(&self.core);
        let thread = thread::Builder::new()
            .name("featherbase-autocompaction".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let core = match weak.upgrade() {
                    Some(core) => core,
                    None => break,
                };
                let worker = Arc::clone(&core);
                if let Err(err) = core
                    .executor
                    .submit(false, move || worker.inner.lock().compact())
                {
                    log_warn!("autocompaction failed: {err}");
                }
            })
            .expect("failed to spawn the autocompaction thread");
        *self.core.autocompaction.lock() = Some(AutocompactionHandle { stop_tx, thread });
    }

    pub fn stop_autocompaction(&self) {
        if let Some(handle) = self.core.autocompaction.lock().take() {
            drop(handle.stop_tx);
            let _ = handle.thread.join();
        }
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        self.stop_autocompaction();
    }
}

// ============================================================================
// TESTS
// ============================================================================
