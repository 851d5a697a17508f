//! Human-readable validation report.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use serde::Serialize;

use flashsync_common::timesync::TimeSyncStats;

use crate::alignment::{OffsetSign, ValidationResult};
use crate::flash::StreamDetection;

/// One device row of the report.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceLine {
    pub name: String,
    pub offset_ns: u64,
    pub sign: OffsetSign,
    pub events: usize,
    pub has_video: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub devices: Vec<DeviceLine>,
    pub clock_sync: BTreeMap<String, TimeSyncStats>,
    pub streams: Vec<StreamDetection>,
    pub result: ValidationResult,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.result.passed
    }
}

fn ms(ns: i64) -> f64 {
    ns as f64 / 1e6
}

fn fmt_spread(ms: f64) -> String {
    if ms.is_finite() {
        format!("{ms:.3}")
    } else {
        "inf".to_string()
    }
}

fn fmt_timestamp(ns: i64) -> String {
    match Utc.timestamp_opt(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => ns.to_string(),
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.result;
        writeln!(f, "=== Flash Sync Validation Report ===")?;
        writeln!(f, "Session: {}", self.session_id)?;
        writeln!(f, "Session Dir: {}", self.session_dir.display())?;
        if let Some(reference) = &r.reference {
            writeln!(f, "Reference Device: {reference}")?;
        }

        writeln!(f)?;
        writeln!(f, "Devices and Offsets (ns):")?;
        for d in &self.devices {
            writeln!(
                f,
                "  - {}: offset={} sign={} events={} brightness={}",
                d.name,
                d.offset_ns,
                d.sign,
                d.events,
                if d.has_video { "yes" } else { "no" }
            )?;
        }

        if !self.clock_sync.is_empty() {
            writeln!(f)?;
            writeln!(f, "Clock Sync:")?;
            for (name, s) in &self.clock_sync {
                writeln!(
                    f,
                    "  - {name}: offset={} min_delay={:.3}ms std_dev={:.3}ms trials={} at {}",
                    s.offset_ns,
                    ms(s.delay_ns),
                    ms(s.std_dev_ns),
                    s.trials,
                    fmt_timestamp(s.timestamp_ns)
                )?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Detected Streams:")?;
        if self.streams.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for s in &self.streams {
            writeln!(f, "  - {}: fps={:.2} peaks={}", s.name, s.fps, s.frame_indices.len())?;
        }
        for (name, t0) in &r.t0_by_stream {
            writeln!(f, "  T0[{name}] = {t0} ns")?;
        }
        if !r.excluded_streams.is_empty() {
            writeln!(f, "  Excluded: {}", r.excluded_streams.join(", "))?;
        }

        writeln!(f)?;
        writeln!(f, "Per-Event Spread (ms):")?;
        for (k, spread) in r.per_event_spread_ms.iter().enumerate() {
            writeln!(f, "  Event {}: {}", k + 1, fmt_spread(*spread))?;
        }
        writeln!(f, "Overall Max Spread: {} ms", fmt_spread(r.overall_max_ms))?;
        write!(
            f,
            "Verdict: {} (tolerance {} ms)",
            if r.passed { "PASS" } else { "FAIL" },
            r.tolerance_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(passed: bool, spreads: Vec<f64>) -> ValidationReport {
        ValidationReport {
            session_id: "s1".into(),
            session_dir: PathBuf::from("/data/s1"),
            devices: vec![DeviceLine {
                name: "phone_a".into(),
                offset_ns: 3_000_000,
                sign: OffsetSign::Minus,
                events: 3,
                has_video: true,
            }],
            clock_sync: BTreeMap::from([(
                "phone_a".to_string(),
                TimeSyncStats {
                    offset_ns: -3_000_000,
                    delay_ns: 1_250_000,
                    std_dev_ns: 40_000,
                    trials: 12,
                    timestamp_ns: 0,
                },
            )]),
            streams: vec![StreamDetection {
                name: "PC".into(),
                frame_indices: vec![10, 20],
                fps: 30.0,
            }],
            result: ValidationResult {
                reference: Some("phone_a".into()),
                overall_max_ms: spreads.iter().copied().fold(0.0, f64::max),
                per_event_spread_ms: spreads,
                passed,
                tolerance_ms: 5.0,
                t0_by_stream: BTreeMap::from([("PC".to_string(), 42)]),
                excluded_streams: vec!["dark".into()],
            },
        }
    }

    #[test]
    fn test_report_sections() {
        let text = sample(true, vec![0.5, 1.25]).to_string();
        assert!(text.starts_with("=== Flash Sync Validation Report ==="));
        assert!(text.contains("  - phone_a: offset=3000000 sign=-1 events=3 brightness=yes"));
        assert!(text.contains("min_delay=1.250ms"));
        assert!(text.contains("at 1970-01-01T00:00:00+00:00"));
        assert!(text.contains("  - PC: fps=30.00 peaks=2"));
        assert!(text.contains("T0[PC] = 42 ns"));
        assert!(text.contains("Excluded: dark"));
        assert!(text.contains("  Event 2: 1.250"));
        assert!(text.ends_with("Verdict: PASS (tolerance 5 ms)"));
    }

    #[test]
    fn test_infinite_spread_prints_inf() {
        let text = sample(false, vec![f64::INFINITY]).to_string();
        assert!(text.contains("  Event 1: inf"));
        assert!(text.contains("Overall Max Spread: inf ms"));
        assert!(text.contains("Verdict: FAIL"));
    }
}
