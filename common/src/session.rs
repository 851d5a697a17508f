//! Session-scoped storage on the hub.
//!
//! Layout under the storage root:
//!
//! ```text
//! <base_dir>/<session_id>/<filename>              received files
//! <base_dir>/<session_id>/metadata.json           {"received_files": [...]}
//! <base_dir>/<session_id>/session_metadata.json   clock offsets per device
//! ```
//!
//! Both JSON files are rewritten whole (temp file + rename) under one lock,
//! so concurrent readers always see a complete document.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::timesync::TimeSyncStats;

pub const MANIFEST_FILE: &str = "metadata.json";
pub const SESSION_METADATA_FILE: &str = "session_metadata.json";

/// Files the store itself owns at a session root, including the temp
/// files of their atomic rewrites.
const RESERVED_NAMES: [&str; 4] = [
    MANIFEST_FILE,
    SESSION_METADATA_FILE,
    "metadata.json.tmp",
    "session_metadata.json.tmp",
];

pub const DEFAULT_SESSION_ID: &str = "unknown_session";
pub const DEFAULT_FILENAME: &str = "data.bin";
pub const DEFAULT_DEVICE_ID: &str = "unknown_device";

/// One received file, as listed in a session's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub filename: String,
    pub size: u64,
    pub device_id: String,
    pub received_at_ns: i64,
}

/// Clock-sync bookkeeping for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub clock_offsets_ns: BTreeMap<String, i64>,
    #[serde(default)]
    pub clock_sync: BTreeMap<String, TimeSyncStats>,
    /// Keys written by other tools, preserved on rewrite.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reduce a session id to a single safe directory name.
pub fn sanitize_session_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let cleaned = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if cleaned.is_empty() {
        DEFAULT_SESSION_ID.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Turn a device-supplied filename into a path relative to the session
/// directory. Root, prefix, `.` and `..` components are dropped, so the
/// result can never point outside. `None` if nothing usable remains.
pub fn sanitize_relative_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        if let Component::Normal(part) = component {
            let part = part.to_string_lossy();
            if part.chars().any(|c| c.is_control()) {
                continue;
            }
            out.push(part.as_ref());
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Move an upload path off the store's own documents: when its first
/// component names a reserved file (case-insensitively) that component
/// gets a `_` prefix. Other paths are returned unchanged.
pub fn avoid_reserved(rel: PathBuf) -> PathBuf {
    let mut components = rel.components();
    let first = match components.next() {
        Some(Component::Normal(first)) => first.to_string_lossy().into_owned(),
        _ => return rel,
    };
    if !RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(&first)) {
        return rel;
    }
    let mut out = PathBuf::from(format!("_{first}"));
    out.extend(components);
    out
}

/// Owns the storage root and serializes writes to the per-session JSON
/// documents.
#[derive(Debug)]
pub struct SessionStore {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of `session_id` (not created).
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(sanitize_session_id(session_id))
    }

    /// Create the session directory if absent.
    pub fn ensure_session_dir(&self, session_id: &str) -> io::Result<PathBuf> {
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Append one record to the session manifest.
    ///
    /// Other top-level keys of `metadata.json` are preserved; an unreadable
    /// manifest is replaced rather than blocking new records.
    pub fn append_manifest(&self, session_id: &str, record: &ManifestRecord) -> io::Result<()> {
        let dir = self.ensure_session_dir(session_id)?;
        let path = dir.join(MANIFEST_FILE);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = match read_json_object(&path) {
            Ok(doc) => doc,
            Err(e) => {
                debug!("Starting fresh manifest at {}: {e}", path.display());
                Map::new()
            }
        };
        let entry = serde_json::to_value(record).map_err(invalid_data)?;
        match doc.get_mut("received_files") {
            Some(Value::Array(files)) => files.push(entry),
            _ => {
                doc.insert("received_files".into(), Value::Array(vec![entry]));
            }
        }
        write_json_atomic(&path, &Value::Object(doc))
    }

    /// Records of the session manifest, empty when none exists yet.
    pub fn read_manifest(&self, session_id: &str) -> io::Result<Vec<ManifestRecord>> {
        let path = self.session_dir(session_id).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let doc = read_json_object(&path)?;
        match doc.get("received_files") {
            Some(files) => serde_json::from_value(files.clone()).map_err(invalid_data),
            None => Ok(Vec::new()),
        }
    }

    /// Session metadata, or an empty document when none exists yet.
    pub fn read_session_metadata(&self, session_id: &str) -> io::Result<SessionMetadata> {
        load_session_metadata(&self.session_dir(session_id))
    }

    /// Store a device's clock-sync result in `session_metadata.json`.
    pub fn record_clock_sync(
        &self,
        session_id: &str,
        device: &str,
        stats: &TimeSyncStats,
    ) -> io::Result<()> {
        let dir = self.ensure_session_dir(session_id)?;
        let path = dir.join(SESSION_METADATA_FILE);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = if path.exists() {
            load_session_metadata(&dir)?
        } else {
            SessionMetadata::default()
        };
        meta.version = 1;
        meta.session_id = sanitize_session_id(session_id);
        meta.clock_offsets_ns.insert(device.to_string(), stats.offset_ns);
        meta.clock_sync.insert(device.to_string(), *stats);

        let value = serde_json::to_value(&meta).map_err(invalid_data)?;
        write_json_atomic(&path, &value)
    }
}

/// Read `session_metadata.json` from a session directory.
///
/// Only an unreadable file or a document that is not a JSON object is an
/// error; individual bad entries are skipped, see
/// [`SessionMetadata::from_document`].
pub fn load_session_metadata(session_dir: &Path) -> io::Result<SessionMetadata> {
    let path = session_dir.join(SESSION_METADATA_FILE);
    if !path.exists() {
        return Ok(SessionMetadata::default());
    }
    Ok(SessionMetadata::from_document(read_json_object(&path)?))
}

impl SessionMetadata {
    /// Build from a parsed document, one entry at a time. Offsets may be
    /// JSON integers, floats (truncated) or numeric strings; offsets and
    /// `clock_sync` entries that do not parse are dropped with a warning,
    /// never the whole document.
    pub fn from_document(mut doc: Map<String, Value>) -> Self {
        let version = doc
            .remove("version")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        let session_id = match doc.remove("session_id") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };

        let mut clock_offsets_ns = BTreeMap::new();
        for (device, value) in take_object(&mut doc, "clock_offsets_ns") {
            match offset_ns(&value) {
                Some(ns) => {
                    clock_offsets_ns.insert(device, ns);
                }
                None => warn!("Ignoring clock offset of {device}: {value}"),
            }
        }

        let mut clock_sync = BTreeMap::new();
        for (device, value) in take_object(&mut doc, "clock_sync") {
            match serde_json::from_value::<TimeSyncStats>(value) {
                Ok(stats) => {
                    clock_sync.insert(device, stats);
                }
                Err(e) => warn!("Ignoring clock sync stats of {device}: {e}"),
            }
        }

        Self {
            version,
            session_id,
            clock_offsets_ns,
            clock_sync,
            extra: doc,
        }
    }
}

fn take_object(doc: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match doc.remove(key) {
        Some(Value::Object(map)) => map,
        Some(other) => {
            warn!("Ignoring {key}: expected an object, got {other}");
            Map::new()
        }
        None => Map::new(),
    }
}

/// Offset in ns from a JSON value; fractional values are truncated.
fn offset_ns(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            let f = n.as_f64()?;
            (f.is_finite() && f.abs() < i64::MAX as f64).then(|| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_json_object(path: &Path) -> io::Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str(&text).map_err(invalid_data)? {
        Value::Object(map) => Ok(map),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a JSON object", path.display()),
        )),
    }
}

fn write_json_atomic(path: &Path, value: &Value) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(invalid_data)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(name: &str, size: u64) -> ManifestRecord {
        ManifestRecord {
            filename: name.to_string(),
            size,
            device_id: "d1".to_string(),
            received_at_ns: 1,
        }
    }

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(sanitize_relative_path("f.bin"), Some(PathBuf::from("f.bin")));
        assert_eq!(
            sanitize_relative_path("rgb/video.mp4"),
            Some(PathBuf::from("rgb/video.mp4"))
        );
        assert_eq!(
            sanitize_relative_path("../../etc/passwd"),
            Some(PathBuf::from("etc/passwd"))
        );
        assert_eq!(
            sanitize_relative_path("/abs/path.csv"),
            Some(PathBuf::from("abs/path.csv"))
        );
        assert_eq!(
            sanitize_relative_path("..\\..\\win.ini"),
            Some(PathBuf::from("win.ini"))
        );
        assert_eq!(sanitize_relative_path("../.."), None);
        assert_eq!(sanitize_relative_path(""), None);
    }

    #[test]
    fn test_reserved_names_are_moved_aside() {
        assert_eq!(avoid_reserved(PathBuf::from("metadata.json")), PathBuf::from("_metadata.json"));
        assert_eq!(
            avoid_reserved(PathBuf::from("Session_Metadata.JSON")),
            PathBuf::from("_Session_Metadata.JSON")
        );
        assert_eq!(
            avoid_reserved(PathBuf::from("metadata.json.tmp")),
            PathBuf::from("_metadata.json.tmp")
        );
        assert_eq!(
            avoid_reserved(PathBuf::from("metadata.json/x.bin")),
            PathBuf::from("_metadata.json/x.bin")
        );
        // Only the session root is reserved.
        assert_eq!(
            avoid_reserved(PathBuf::from("phone/metadata.json")),
            PathBuf::from("phone/metadata.json")
        );
        assert_eq!(avoid_reserved(PathBuf::from("_metadata.json")), PathBuf::from("_metadata.json"));
    }

    #[test]
    fn test_metadata_entries_parse_independently() {
        let doc = serde_json::json!({
            "version": 1,
            "clock_offsets_ns": {"phone_a": 3000000, "phone_b": 7000000.0, "phone_c": "-5", "bad": [1]},
            "clock_sync": {
                "phone_a": {"offset_ns": 3000000, "delay_ns": 1},
                "phone_b": {"offset_ns": 7, "delay_ns": 2, "std_dev": 3, "trials": 4, "timestamp_ns": 5}
            },
            "notes": "kept"
        });
        let Value::Object(doc) = doc else { unreachable!() };
        let meta = SessionMetadata::from_document(doc);

        assert_eq!(meta.version, 1);
        assert_eq!(meta.clock_offsets_ns["phone_a"], 3_000_000);
        assert_eq!(meta.clock_offsets_ns["phone_b"], 7_000_000);
        assert_eq!(meta.clock_offsets_ns["phone_c"], -5);
        assert!(!meta.clock_offsets_ns.contains_key("bad"));
        assert!(!meta.clock_sync.contains_key("phone_a"));
        assert_eq!(meta.clock_sync["phone_b"].std_dev_ns, 3);
        assert_eq!(meta.extra["notes"], "kept");
    }

    #[test]
    fn test_metadata_wrong_section_type_keeps_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(SESSION_METADATA_FILE),
            r#"{"clock_offsets_ns": {"d": 12}, "clock_sync": [1, 2]}"#,
        )
        .unwrap();
        let meta = load_session_metadata(tmp.path()).unwrap();
        assert_eq!(meta.clock_offsets_ns["d"], 12);
        assert!(meta.clock_sync.is_empty());
    }

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize_session_id("20250101_120000"), "20250101_120000");
        assert_eq!(sanitize_session_id("../evil"), "evil");
        assert_eq!(sanitize_session_id("a/b"), "ab");
        assert_eq!(sanitize_session_id(".."), DEFAULT_SESSION_ID);
    }

    #[test]
    fn test_manifest_appends_and_preserves_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let dir = store.ensure_session_dir("s1").unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), r#"{"state": "Recording"}"#).unwrap();

        store.append_manifest("s1", &record("a.bin", 3)).unwrap();
        store.append_manifest("s1", &record("b.bin", 5)).unwrap();

        let records = store.read_manifest("s1").unwrap();
        assert_eq!(records, vec![record("a.bin", 3), record("b.bin", 5)]);

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join(MANIFEST_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["state"], "Recording");
    }

    #[test]
    fn test_manifest_replaces_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let dir = store.ensure_session_dir("s1").unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), "{not json").unwrap();

        store.append_manifest("s1", &record("a.bin", 3)).unwrap();
        assert_eq!(store.read_manifest("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(tmp.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..5 {
                        store
                            .append_manifest("s1", &record(&format!("f{i}_{j}"), 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.read_manifest("s1").unwrap().len(), 40);
    }

    #[test]
    fn test_record_clock_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let stats = TimeSyncStats {
            offset_ns: -2_500_000,
            delay_ns: 400_000,
            std_dev_ns: 1_000,
            trials: 12,
            timestamp_ns: 99,
        };
        store.record_clock_sync("s1", "phone_a", &stats).unwrap();

        let meta = store.read_session_metadata("s1").unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.clock_offsets_ns["phone_a"], -2_500_000);
        assert_eq!(meta.clock_sync["phone_a"], stats);
    }

    #[test]
    fn test_missing_documents_are_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(store.read_manifest("nope").unwrap().is_empty());
        assert_eq!(
            store.read_session_metadata("nope").unwrap(),
            SessionMetadata::default()
        );
    }
}
