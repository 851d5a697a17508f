//! Full validation pipeline: session directory in, report out.

use std::collections::BTreeMap;

use tracing::{info, warn};

use flashsync_common::{SyncError, SyncResult};

use crate::alignment::{align_devices, compute_validation_report};
use crate::flash::{detect_flash_indices, StreamDetection, DEFAULT_MIN_SEPARATION};
use crate::loader::{read_brightness, SessionInputs};
use crate::report::{DeviceLine, ValidationReport};

/// Options of one validation run.
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub tolerance_ms: f64,
    /// Reference device; smallest device name with events when `None`.
    pub reference: Option<String>,
    pub min_separation: usize,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            tolerance_ms: crate::alignment::DEFAULT_TOLERANCE_MS,
            reference: None,
            min_separation: DEFAULT_MIN_SEPARATION,
        }
    }
}

/// Detect, align and judge one loaded session.
///
/// Errors only on unusable input: no device recorded any flash event, or
/// the requested reference has none.
pub fn validate(inputs: &SessionInputs, opts: &ValidateOptions) -> SyncResult<ValidationReport> {
    let n_events = inputs.expected_events();
    if n_events == 0 {
        return Err(SyncError::ValidationInput(format!(
            "no flash events found in any device of session {}",
            inputs.session_id
        )));
    }

    let (reference, devices) = align_devices(
        &inputs.raw_events(),
        &inputs.stored_offsets(),
        opts.reference.as_deref(),
    )?;
    info!("Reference device: {reference} ({n_events} expected events)");

    let mut detections = BTreeMap::new();
    for (name, path) in inputs.brightness_sources() {
        let series = match read_brightness(&path) {
            Ok(series) => series,
            Err(e) => {
                warn!("Skipping stream {name}: {e}");
                continue;
            }
        };
        let frame_indices = detect_flash_indices(&series.brightness, n_events, opts.min_separation);
        info!(
            "Stream {name}: {} of {n_events} flashes at {:.2} fps",
            frame_indices.len(),
            series.fps
        );
        detections.insert(
            name.clone(),
            StreamDetection {
                name,
                frame_indices,
                fps: series.fps,
            },
        );
    }

    let aligned: BTreeMap<String, Vec<i64>> = devices
        .iter()
        .filter(|d| !d.aligned_events_ns.is_empty())
        .map(|d| (d.name.clone(), d.aligned_events_ns.clone()))
        .collect();

    let result = compute_validation_report(
        &aligned,
        &detections,
        Some(reference.as_str()),
        opts.tolerance_ms,
    );

    let device_lines = devices
        .into_iter()
        .map(|d| {
            let has_video = inputs
                .devices
                .iter()
                .any(|i| i.name == d.name && i.brightness.is_some());
            DeviceLine {
                name: d.name,
                offset_ns: d.offset_ns,
                sign: d.sign,
                events: d.aligned_events_ns.len(),
                has_video,
            }
        })
        .collect();

    Ok(ValidationReport {
        session_id: inputs.session_id.clone(),
        session_dir: inputs.dir.clone(),
        devices: device_lines,
        clock_sync: inputs.clock_sync.clone(),
        streams: detections.into_values().collect(),
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_session;

    const SEC: i64 = 1_000_000_000;

    /// Brightness at `fps` with flashes at the given seconds.
    fn brightness_json(fps: f64, seconds: &[f64], len: usize) -> String {
        let mut values = vec![12.0; len];
        for s in seconds {
            values[(s * fps).round() as usize] = 215.0;
        }
        serde_json::json!({"fps": fps, "brightness": values}).to_string()
    }

    fn write_session(root: &std::path::Path) {
        let dir = root.join("s1");
        std::fs::create_dir_all(dir.join("phone_a/rgb")).unwrap();
        std::fs::create_dir_all(dir.join("phone_b")).unwrap();

        // Hub clock: flashes at 10s, 12s, 14s. phone_a is 3ms behind the
        // hub, phone_b 7ms ahead.
        let hub = [10 * SEC, 12 * SEC, 14 * SEC];
        let csv = |shift: i64| {
            let rows: Vec<String> = hub.iter().map(|t| (t + shift).to_string()).collect();
            format!("timestamp_ns\n{}\n", rows.join("\n"))
        };
        std::fs::write(dir.join("phone_a/flash_sync_events.csv"), csv(-3_000_000)).unwrap();
        std::fs::write(dir.join("phone_b/flash_sync_events.csv"), csv(7_000_000)).unwrap();
        std::fs::write(
            dir.join("session_metadata.json"),
            r#"{"clock_offsets_ns": {"phone_a": 3000000, "phone_b": 7000000}}"#,
        )
        .unwrap();

        // Videos start 9s into the hub timeline.
        std::fs::write(
            dir.join("phone_a/rgb/brightness.json"),
            brightness_json(100.0, &[1.0, 3.0, 5.0], 700),
        )
        .unwrap();
        std::fs::write(
            dir.join("webcam_brightness.json"),
            brightness_json(50.0, &[1.0, 3.0, 5.0], 350),
        )
        .unwrap();
    }

    #[test]
    fn test_end_to_end_pass() {
        let tmp = tempfile::tempdir().unwrap();
        write_session(tmp.path());

        let inputs = load_session(tmp.path(), "s1").unwrap();
        let report = validate(&inputs, &ValidateOptions::default()).unwrap();

        assert_eq!(report.result.reference.as_deref(), Some("phone_a"));
        assert_eq!(report.result.per_event_spread_ms.len(), 3);
        assert!(report.result.overall_max_ms < 0.001, "{}", report.result.overall_max_ms);
        assert!(report.result.passed);
        assert_eq!(report.result.t0_by_stream["PC"], 9 * SEC);
        assert_eq!(report.result.t0_by_stream["phone_a"], 9 * SEC);
        assert_eq!(report.streams.len(), 2);
        assert!(report.devices[0].has_video);
        assert!(!report.devices[1].has_video);
    }

    #[test]
    fn test_tight_tolerance_fails() {
        let tmp = tempfile::tempdir().unwrap();
        write_session(tmp.path());
        // Claim phone_b is only 1ms off: its events land 6ms late.
        std::fs::write(
            tmp.path().join("s1/session_metadata.json"),
            r#"{"clock_offsets_ns": {"phone_a": 3000000, "phone_b": 1000000}}"#,
        )
        .unwrap();

        let inputs = load_session(tmp.path(), "s1").unwrap();
        let report = validate(&inputs, &ValidateOptions::default()).unwrap();
        assert!(!report.result.passed);
        assert!(report.result.overall_max_ms > 5.0);
    }

    #[test]
    fn test_no_events_is_input_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("s1/phone_a")).unwrap();
        let inputs = load_session(tmp.path(), "s1").unwrap();
        assert!(matches!(
            validate(&inputs, &ValidateOptions::default()),
            Err(SyncError::ValidationInput(_))
        ));
    }
}
