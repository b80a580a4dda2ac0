// src/persistence.rs
//! Append-only datafile handling.
//!
//! One UTF-8 text file per datastore, one event per line: a serialized
//! document, a `$$deleted` record, or an `$$indexCreated` / `$$indexRemoved`
//! declaration. Loading folds the events into the final document set;
//! rewrites go through a temp-file + fsync + rename sequence so a crash at
//! any step leaves either the old or the new file intact, recoverable via
//! the `<file>~` side-file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::document::Value;
use crate::error::{FeatherError, Result};
use crate::index::IndexOptions;
use crate::log_warn;

/// State reconstructed from a datafile.
#[derive(Debug, Default)]
pub struct LoadedData {
    /// Final document set, keyed by `_id`.
    pub documents: HashMap<String, Value>,
    /// Index declarations still in effect, in declaration order.
    pub indexes: Vec<IndexOptions>,
    pub corrupt_lines: usize,
    pub total_lines: usize,
}

/// Reader/writer for one datastore's datafile. A `None` filename is an
/// in-memory datastore: every I/O operation becomes a no-op.
#[derive(Debug)]
pub struct Persistence {
    filename: Option<PathBuf>,
    corrupt_alert_threshold: f64,
}

impl Persistence {
    pub fn new(filename: Option<PathBuf>, corrupt_alert_threshold: f64) -> Self {
        Persistence {
            filename,
            corrupt_alert_threshold,
        }
    }

    pub fn in_memory(&self) -> bool {
        self.filename.is_none()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// Datafile integrity check on open: prefer `<file>`; recover an
    /// interrupted rewrite from `<file>~`; otherwise start empty.
    pub fn ensure_datafile_integrity(&self) -> Result<()> {
        let path = match &self.filename {
            Some(path) => path,
            None => return Ok(()),
        };
        if path.exists() {
            return Ok(());
        }
        let tmp = temp_path(path);
        if tmp.exists() {
            fs::rename(&tmp, path)?;
            return Ok(());
        }
        File::create(path)?;
        Ok(())
    }

    /// Read and fold the datafile.
    pub fn load(&self) -> Result<LoadedData> {
        let path = match &self.filename {
            Some(path) => path,
            None => return Ok(LoadedData::default()),
        };
        self.ensure_datafile_integrity()?;
        let raw = fs::read_to_string(path)?;
        self.treat_raw_data(&raw)
    }

    /// Fold raw datafile text into the final state. Malformed lines are
    /// skipped and counted; once their fraction exceeds the threshold the
    /// whole load fails.
    pub fn treat_raw_data(&self, raw: &str) -> Result<LoadedData> {
        let mut data = LoadedData::default();
        for line in raw.split('\n') {
            if line.is_empty() {
                continue;
            }
            data.total_lines += 1;
            let json: serde_json::Value = match serde_json::from_str(line) {
                Ok(json) => json,
                Err(_) => {
                    data.corrupt_lines += 1;
                    continue;
                }
            };
            if json
                .get("$$deleted")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
            {
                if let Some(id) = json.get("_id").and_then(serde_json::Value::as_str) {
                    data.documents.remove(id);
                }
            } else if let Some(spec) = json.get("$$indexCreated") {
                match parse_index_spec(spec) {
                    Some(options) => {
                        data.indexes.retain(|existing| existing.name() != options.name());
                        data.indexes.push(options);
                    }
                    None => log_warn!("ignoring malformed index declaration: {line}"),
                }
            } else if let Some(name) = json
                .get("$$indexRemoved")
                .and_then(serde_json::Value::as_str)
            {
                data.indexes.retain(|existing| existing.name() != name);
            } else if let Some(id) = json.get("_id").and_then(serde_json::Value::as_str) {
                data.documents
                    .insert(id.to_string(), Value::from_json(&json));
            }
            // Anything else parses but matches no event shape; ignore it.
        }

        if data.total_lines > 0 {
            let fraction = data.corrupt_lines as f64 / data.total_lines as f64;
            if fraction > self.corrupt_alert_threshold {
                return Err(FeatherError::LoadCorrupted {
                    corrupt: data.corrupt_lines,
                    total: data.total_lines,
                    threshold: self.corrupt_alert_threshold,
                });
            }
        }
        Ok(data)
    }

    /// Append event lines in one buffered write, then fsync. The descriptor
    /// lives only for this call.
    pub fn append_lines(&self, lines: &[String]) -> Result<()> {
        let path = match &self.filename {
            Some(path) => path,
            None => return Ok(()),
        };
        if lines.is_empty() {
            return Ok(());
        }
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(line);
            buffer.push('\n');
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(buffer.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the datafile with a compacted snapshot.
    pub fn persist_cached_database(&self, lines: &[String]) -> Result<()> {
        let path = match &self.filename {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(line);
            buffer.push('\n');
        }
        crash_safe_write_file(path, &buffer)
    }
}

/// The rewrite side-file: `<file>~`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push("~");
    PathBuf::from(os)
}

/// Crash-safe replacement of `path` with `data`:
/// flush the directory, flush the existing target, write and flush the
/// side-file, rename it over the target, flush the directory again.
pub fn crash_safe_write_file(path: &Path, data: &str) -> Result<()> {
    flush_directory(path)?;
    if path.exists() {
        File::open(path)?.sync_all()?;
    }
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    flush_directory(path)?;
    Ok(())
}

#[cfg(unix)]
fn flush_directory(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}

// Directory fsync is not portable; skip it where unsupported.
#[cfg(not(unix))]
fn flush_directory(_path: &Path) -> Result<()> {
    Ok(())
}

// ============================================================================
// EVENT LINES
// ============================================================================

/// `{"$$deleted": true, "_id": id}`
pub fn deletion_line(id: &str) -> String {
    let mut m = serde_json::Map::new();
    m.insert("$$deleted".to_string(), serde_json::Value::Bool(true));
    m.insert("_id".to_string(), serde_json::Value::from(id));
    serde_json::Value::Object(m).to_string()
}

/// `{"$$indexCreated": {"fieldName": ..., "unique": ..., "sparse": ...}}`
pub fn index_created_line(options: &IndexOptions) -> String {
    let field_name = if options.fields.len() == 1 {
        serde_json::Value::from(options.fields[0].clone())
    } else {
        serde_json::Value::Array(
            options
                .fields
                .iter()
                .map(|f| serde_json::Value::from(f.clone()))
                .collect(),
        )
    };
    let mut spec = serde_json::Map::new();
    spec.insert("fieldName".to_string(), field_name);
    spec.insert(
        "unique".to_string(),
        serde_json::Value::Bool(options.unique),
    );
    spec.insert(
        "sparse".to_string(),
        serde_json::Value::Bool(options.sparse),
    );
    if let Some(seconds) = options.expire_after_seconds {
        spec.insert(
            "expireAfterSeconds".to_string(),
            serde_json::Value::from(seconds),
        );
    }
    let mut m = serde_json::Map::new();
    m.insert(
        "$$indexCreated".to_string(),
        serde_json::Value::Object(spec),
    );
    serde_json::Value::Object(m).to_string()
}

/// `{"$$indexRemoved": name}`
pub fn index_removed_line(name: &str) -> String {
    let mut m = serde_json::Map::new();
    m.insert("$$indexRemoved".to_string(), serde_json::Value::from(name));
    serde_json::Value::Object(m).to_string()
}

fn parse_index_spec(spec: &serde_json::Value) -> Option<IndexOptions> {
    let obj = spec.as_object()?;
    let fields: Vec<String> = match obj.get("fieldName")? {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(list) => list
            .iter()
            .map(|f| f.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()?,
        _ => return None,
    };
    if fields.is_empty() || fields.iter().any(String::is_empty) {
        return None;
    }
    Some(IndexOptions {
        fields,
        unique: obj
            .get("unique")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        sparse: obj
            .get("sparse")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        expire_after_seconds: obj
            .get("expireAfterSeconds")
            .and_then(serde_json::Value::as_f64),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::serialize;
    use serde_json::json;
    use tempfile::TempDir;

    fn mem() -> Persistence {
        Persistence::new(None, 0.1)
    }

    #[test]
    fn test_fold_overwrites_and_deletes() {
        let raw = [
            r#"{"_id":"a","n":1}"#,
            r#"{"_id":"b","n":2}"#,
            r#"{"_id":"a","n":10}"#,
            r#"{"$$deleted":true,"_id":"b"}"#,
        ]
        .join("\n");
        let data = mem().treat_raw_data(&raw).unwrap();
        assert_eq!(data.documents.len(), 1);
        assert_eq!(
            data.documents["a"].get("n"),
            Some(&Value::Number(10.0))
        );
    }

    #[test]
    fn test_fold_index_events() {
        let raw = [
            r#"{"$$indexCreated":{"fieldName":"tf","unique":true,"sparse":false}}"#,
            r#"{"$$indexCreated":{"fieldName":["a","b"],"unique":false,"sparse":true}}"#,
            r#"{"$$indexCreated":{"fieldName":"gone","unique":false,"sparse":false}}"#,
            r#"{"$$indexRemoved":"gone"}"#,
        ]
        .join("\n");
        let data = mem().treat_raw_data(&raw).unwrap();
        assert_eq!(data.indexes.len(), 2);
        assert_eq!(data.indexes[0].name(), "tf");
        assert!(data.indexes[0].unique);
        assert_eq!(data.indexes[1].fields, vec!["a", "b"]);
        assert!(data.indexes[1].sparse);
    }

    #[test]
    fn test_index_line_roundtrip() {
        let options = IndexOptions::new("stamp").unique().expire_after(3600.0);
        let line = index_created_line(&options);
        let data = mem().treat_raw_data(&line).unwrap();
        assert_eq!(data.indexes.len(), 1);
        assert_eq!(data.indexes[0], options);
    }

    #[test]
    fn test_corruption_threshold() {
        let p = Persistence::new(None, 0.5);
        // 1 of 3 corrupt: under the 0.5 threshold.
        let raw = "{\"_id\":\"a\"}\ngarbage\n{\"_id\":\"b\"}\n";
        let data = p.treat_raw_data(raw).unwrap();
        assert_eq!(data.corrupt_lines, 1);
        assert_eq!(data.documents.len(), 2);

        // 2 of 3 corrupt: over it.
        let raw = "{\"_id\":\"a\"}\ngarbage\nmore garbage\n";
        let err = p.treat_raw_data(raw).unwrap_err();
        assert_eq!(err.kind(), "loadCorrupted");
    }

    #[test]
    fn test_zero_threshold_rejects_any_corruption() {
        let p = Persistence::new(None, 0.0);
        assert!(p.treat_raw_data("{\"_id\":\"a\"}\n").is_ok());
        assert!(p.treat_raw_data("{\"_id\":\"a\"}\nbad\n").is_err());
    }

    #[test]
    fn test_documents_round_trip_through_lines() {
        let doc = Value::from_json(&json!({"_id": "a", "when": {"$$date": 1000}, "n": 1}));
        let data = mem().treat_raw_data(&serialize(&doc)).unwrap();
        assert_eq!(data.documents["a"], doc);
    }

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        let p = Persistence::new(Some(path.clone()), 0.1);
        p.ensure_datafile_integrity().unwrap();
        p.append_lines(&[r#"{"_id":"a","n":1}"#.to_string()]).unwrap();
        p.append_lines(&[r#"{"_id":"b","n":2}"#.to_string()]).unwrap();

        let data = p.load().unwrap();
        assert_eq!(data.documents.len(), 2);
    }

    #[test]
    fn test_integrity_prefers_main_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        fs::write(&path, "{\"_id\":\"main\"}\n").unwrap();
        fs::write(temp_path(&path), "{\"_id\":\"side\"}\n").unwrap();

        let p = Persistence::new(Some(path.clone()), 0.1);
        let data = p.load().unwrap();
        assert!(data.documents.contains_key("main"));
        assert!(!data.documents.contains_key("side"));
    }

    #[test]
    fn test_integrity_recovers_from_side_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        fs::write(temp_path(&path), "{\"_id\":\"side\"}\n").unwrap();

        let p = Persistence::new(Some(path.clone()), 0.1);
        let data = p.load().unwrap();
        assert!(data.documents.contains_key("side"));
        assert!(path.exists());
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_crash_safe_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        fs::write(&path, "old\n").unwrap();

        crash_safe_write_file(&path, "new\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new\n");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_crash_safe_write_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");
        crash_safe_write_file(&path, "fresh\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn test_in_memory_is_noop() {
        let p = mem();
        assert!(p.in_memory());
        p.append_lines(&["x".to_string()]).unwrap();
        p.persist_cached_database(&["x".to_string()]).unwrap();
        assert!(p.load().unwrap().documents.is_empty());
    }
}
