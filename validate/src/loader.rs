//! Collects a recorded session's validation inputs from disk.
//!
//! Expected layout under `<base_dir>/<session_id>/`:
//!
//! ```text
//! session_metadata.json          clock offsets per device (optional)
//! webcam_brightness.json         hub webcam brightness, stream "PC" (optional)
//! <device>/flash_sync_events.csv flash events on the device clock
//! <device>/rgb/brightness.json   device video brightness (optional)
//! ```
//!
//! Brightness files hold `{"fps": 30.0, "brightness": [..]}`, one mean
//! luminance value per video frame.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use flashsync_common::session::load_session_metadata;
use flashsync_common::timesync::TimeSyncStats;
use flashsync_common::{SyncError, SyncResult};

pub const FLASH_EVENTS_FILE: &str = "flash_sync_events.csv";
pub const BRIGHTNESS_FILE: &str = "brightness.json";
pub const WEBCAM_BRIGHTNESS_FILE: &str = "webcam_brightness.json";

/// Stream name of the hub's own webcam.
pub const PC_STREAM: &str = "PC";

/// Per-frame brightness of one video.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrightnessSeries {
    pub fps: f64,
    pub brightness: Vec<f64>,
}

/// One device directory of the session.
#[derive(Debug, Clone)]
pub struct DeviceInput {
    pub name: String,
    pub dir: PathBuf,
    pub flash_csv: Option<PathBuf>,
    pub brightness: Option<PathBuf>,
    pub raw_events_ns: Vec<i64>,
    /// Signed offset from session metadata, 0 if none matched.
    pub stored_offset_ns: i64,
}

/// Everything the validator reads for one session.
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub session_id: String,
    pub dir: PathBuf,
    /// Sorted by name.
    pub devices: Vec<DeviceInput>,
    pub clock_sync: BTreeMap<String, TimeSyncStats>,
    pub webcam_brightness: Option<PathBuf>,
}

impl SessionInputs {
    /// Largest number of flash events any device recorded.
    pub fn expected_events(&self) -> usize {
        self.devices
            .iter()
            .map(|d| d.raw_events_ns.len())
            .max()
            .unwrap_or(0)
    }

    pub fn raw_events(&self) -> BTreeMap<String, Vec<i64>> {
        self.devices
            .iter()
            .map(|d| (d.name.clone(), d.raw_events_ns.clone()))
            .collect()
    }

    pub fn stored_offsets(&self) -> BTreeMap<String, i64> {
        self.devices
            .iter()
            .map(|d| (d.name.clone(), d.stored_offset_ns))
            .collect()
    }

    /// Brightness sources as (stream name, file), hub webcam first.
    pub fn brightness_sources(&self) -> Vec<(String, PathBuf)> {
        self.webcam_brightness
            .iter()
            .map(|p| (PC_STREAM.to_string(), p.clone()))
            .chain(
                self.devices
                    .iter()
                    .filter_map(|d| d.brightness.clone().map(|p| (d.name.clone(), p))),
            )
            .collect()
    }
}

/// Read the session directory.
///
/// Fails only when the directory is missing or unreadable; absent or
/// malformed optional files are logged and skipped.
pub fn load_session(base_dir: &Path, session_id: &str) -> SyncResult<SessionInputs> {
    let dir = base_dir.join(session_id);
    if !dir.is_dir() {
        return Err(SyncError::ValidationInput(format!(
            "session directory not found: {}",
            dir.display()
        )));
    }

    let (offsets, clock_sync) = match load_session_metadata(&dir) {
        Ok(meta) => (meta.clock_offsets_ns, meta.clock_sync),
        Err(e) => {
            warn!("Cannot read session metadata, using zero offsets: {e}");
            (BTreeMap::new(), BTreeMap::new())
        }
    };
    if offsets.is_empty() {
        debug!("No clock offsets recorded for {session_id}");
    }

    let mut names: Vec<String> = std::fs::read_dir(&dir)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| is_device_dir(name))
        .collect();
    names.sort();

    let devices = names
        .into_iter()
        .map(|name| {
            let dev_dir = dir.join(&name);
            let flash_csv = find_file(&dev_dir, FLASH_EVENTS_FILE);
            let raw_events_ns = match &flash_csv {
                Some(path) => read_flash_events(path).unwrap_or_else(|e| {
                    warn!("Cannot read {}: {e}", path.display());
                    Vec::new()
                }),
                None => Vec::new(),
            };
            let brightness = find_brightness(&dev_dir);
            DeviceInput {
                stored_offset_ns: match_offset(&name, &offsets),
                name,
                dir: dev_dir,
                flash_csv,
                brightness,
                raw_events_ns,
            }
        })
        .collect();

    let webcam = dir.join(WEBCAM_BRIGHTNESS_FILE);
    Ok(SessionInputs {
        session_id: session_id.to_string(),
        webcam_brightness: webcam.is_file().then_some(webcam),
        dir,
        devices,
        clock_sync,
    })
}

/// Hub-local folders (`rgb*`, `gsr*`) are not devices.
fn is_device_dir(name: &str) -> bool {
    let lower = name.to_lowercase();
    !(lower.starts_with("rgb") || lower.starts_with("gsr"))
}

/// Lowercase alphanumerics only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Offset for `device`: exact normalized match, else the first stored name
/// (in key order) that contains or is contained by it, else 0.
pub fn match_offset(device: &str, offsets: &BTreeMap<String, i64>) -> i64 {
    let norm = normalize_name(device);
    let normalized: Vec<(String, i64)> = offsets
        .iter()
        .map(|(k, &v)| (normalize_name(k), v))
        .collect();

    normalized
        .iter()
        .find(|(k, _)| *k == norm)
        .or_else(|| {
            if norm.is_empty() {
                return None;
            }
            normalized
                .iter()
                .find(|(k, _)| !k.is_empty() && (k.contains(&norm) || norm.contains(k.as_str())))
        })
        .map(|(_, v)| *v)
        .unwrap_or(0)
}

/// First column of every data row as ns; the header line and rows whose
/// first column is not an integer are skipped.
pub fn read_flash_events(path: &Path) -> std::io::Result<Vec<i64>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_flash_events(&text))
}

fn parse_flash_events(text: &str) -> Vec<i64> {
    text.lines()
        .skip(1)
        .filter_map(|line| line.split(',').next()?.trim().parse().ok())
        .collect()
}

/// Load a brightness file.
pub fn read_brightness(path: &Path) -> SyncResult<BrightnessSeries> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        SyncError::ValidationInput(format!("{}: {e}", path.display()))
    })
}

/// `name` directly in `dir` (case-insensitive), else anywhere below it.
fn find_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut subdirs = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name) {
            return Some(path);
        }
    }
    subdirs.into_iter().find_map(|d| find_file(&d, name))
}

/// `rgb/brightness.json` if present, else any `brightness.json` below `dir`.
fn find_brightness(dev_dir: &Path) -> Option<PathBuf> {
    let preferred = dev_dir.join("rgb").join(BRIGHTNESS_FILE);
    if preferred.is_file() {
        return Some(preferred);
    }
    find_file(dev_dir, BRIGHTNESS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flash_events() {
        let csv = "timestamp_ns,label\n1000,flash\nbad,row\n\n2000\n 3000 ,x\n";
        assert_eq!(parse_flash_events(csv), vec![1000, 2000, 3000]);
        assert!(parse_flash_events("").is_empty());
    }

    #[test]
    fn test_match_offset() {
        let offsets = BTreeMap::from([
            ("Pixel-7 (A)".to_string(), 111),
            ("galaxy".to_string(), -222),
        ]);
        assert_eq!(match_offset("pixel7a", &offsets), 111);
        assert_eq!(match_offset("galaxy_s22", &offsets), -222);
        assert_eq!(match_offset("iphone", &offsets), 0);
        assert_eq!(normalize_name("Pixel-7 (A)"), "pixel7a");
    }

    #[test]
    fn test_load_session_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("s1");
        std::fs::create_dir_all(dir.join("phone_b/nested")).unwrap();
        std::fs::create_dir_all(dir.join("phone_a/rgb")).unwrap();
        std::fs::create_dir_all(dir.join("rgb_local")).unwrap();
        std::fs::create_dir_all(dir.join("GSR")).unwrap();

        std::fs::write(dir.join("phone_a/FLASH_SYNC_EVENTS.csv"), "ts\n10\n20\n").unwrap();
        std::fs::write(dir.join("phone_b/nested/flash_sync_events.csv"), "ts\n11\n21\n31\n").unwrap();
        std::fs::write(
            dir.join("phone_a/rgb/brightness.json"),
            r#"{"fps": 30.0, "brightness": [1.0, 2.0]}"#,
        )
        .unwrap();
        std::fs::write(dir.join(WEBCAM_BRIGHTNESS_FILE), r#"{"fps": 25, "brightness": []}"#)
            .unwrap();
        std::fs::write(
            dir.join("session_metadata.json"),
            r#"{"clock_offsets_ns": {"phone_a": 5, "phone_b": -7},
                "clock_sync": {"phone_a": {"offset_ns": 5, "delay_ns": 1, "std_dev": 2, "trials": 12, "timestamp_ns": 3}}}"#,
        )
        .unwrap();

        let inputs = load_session(tmp.path(), "s1").unwrap();
        let names: Vec<&str> = inputs.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["phone_a", "phone_b"]);
        assert_eq!(inputs.devices[0].raw_events_ns, vec![10, 20]);
        assert_eq!(inputs.devices[1].raw_events_ns, vec![11, 21, 31]);
        assert_eq!(inputs.devices[1].stored_offset_ns, -7);
        assert_eq!(inputs.expected_events(), 3);
        assert_eq!(inputs.clock_sync["phone_a"].std_dev_ns, 2);

        let sources = inputs.brightness_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].0, PC_STREAM);
        assert_eq!(sources[1].0, "phone_a");
        assert_eq!(read_brightness(&sources[1].1).unwrap().brightness, vec![1.0, 2.0]);
    }

    #[test]
    fn test_missing_session_is_input_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_session(tmp.path(), "nope"),
            Err(SyncError::ValidationInput(_))
        ));
    }

    #[test]
    fn test_partial_stats_keep_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("s1");
        std::fs::create_dir_all(dir.join("phone_a")).unwrap();
        std::fs::create_dir_all(dir.join("phone_b")).unwrap();
        std::fs::write(
            dir.join("session_metadata.json"),
            r#"{"clock_offsets_ns": {"phone_a": 3000000, "phone_b": 7000000.0},
                "clock_sync": {"phone_a": {"offset_ns": 3000000, "delay_ns": 1}}}"#,
        )
        .unwrap();

        let inputs = load_session(tmp.path(), "s1").unwrap();
        assert_eq!(inputs.devices[0].stored_offset_ns, 3_000_000);
        assert_eq!(inputs.devices[1].stored_offset_ns, 7_000_000);
        assert!(inputs.clock_sync.is_empty());
    }

    #[test]
    fn test_bad_metadata_means_zero_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("s1");
        std::fs::create_dir_all(dir.join("dev")).unwrap();
        std::fs::write(dir.join("session_metadata.json"), "{broken").unwrap();
        let inputs = load_session(tmp.path(), "s1").unwrap();
        assert_eq!(inputs.devices[0].stored_offset_ns, 0);
        assert_eq!(inputs.expected_events(), 0);
    }
}
