// featherbase-core/src/lib.rs
// Embedded, single-process, file-backed document database: one collection =
// one append-only datafile + an in-memory id-map and ordered indexes.

#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(dead_code))]

pub mod compare;
pub mod cursor;
pub mod datastore;
pub mod document;
pub mod error;
pub mod executor;
pub mod index;
pub mod logging;
pub mod persistence;
pub mod projection;
pub mod query;
pub mod update;

// Public exports
pub use compare::{compare_things, compare_things_with, StringComparator};
pub use cursor::Cursor;
pub use datastore::{
    Datastore, DatastoreOptions, RemoveOptions, UpdateOptions, UpdateOutcome,
};
pub use document::{
    check_object, deep_copy, deserialize, doc_id, generate_id, serialize, Map, Value,
};
pub use error::{FeatherError, Result};
pub use index::{Index, IndexKey, IndexOptions};
pub use logging::{log_level, set_log_level, LogLevel};
pub use projection::project;
pub use query::{match_query, Query, WherePredicate};
pub use update::modify;
