//! Clock alignment of device flash events and the PASS/FAIL computation.
//!
//! Every device logs flash events on its own clock. Adding the signed
//! clock offset puts them on the hub clock ("aligned"). Each video stream
//! only knows frame times relative to its first frame, so its absolute
//! start time `T0` is fitted against the reference device's aligned
//! events. An event passes when all those estimates agree within the
//! tolerance.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use flashsync_common::{SyncError, SyncResult};

use crate::flash::StreamDetection;

/// Default PASS threshold for the per-event spread.
pub const DEFAULT_TOLERANCE_MS: f64 = 5.0;

/// Direction in which a device's offset is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OffsetSign {
    Plus,
    Minus,
}

impl OffsetSign {
    pub fn factor(self) -> i64 {
        match self {
            OffsetSign::Plus => 1,
            OffsetSign::Minus => -1,
        }
    }

    /// Sign of a stored signed offset; zero counts as positive.
    pub fn of(offset_ns: i64) -> Self {
        if offset_ns < 0 {
            OffsetSign::Minus
        } else {
            OffsetSign::Plus
        }
    }
}

impl fmt::Display for OffsetSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OffsetSign::Plus => "+1",
            OffsetSign::Minus => "-1",
        })
    }
}

/// One device's flash events before and after alignment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceOffset {
    pub name: String,
    /// Offset magnitude.
    pub offset_ns: u64,
    pub sign: OffsetSign,
    /// Device-local flash timestamps.
    pub raw_events_ns: Vec<i64>,
    /// `raw + sign * offset`.
    pub aligned_events_ns: Vec<i64>,
}

impl DeviceOffset {
    pub fn new(name: impl Into<String>, offset_ns: u64, raw_events_ns: Vec<i64>) -> Self {
        let mut device = Self {
            name: name.into(),
            offset_ns,
            sign: OffsetSign::Plus,
            raw_events_ns,
            aligned_events_ns: Vec::new(),
        };
        device.apply(OffsetSign::Plus);
        device
    }

    /// Recompute the aligned events for `sign`.
    pub fn apply(&mut self, sign: OffsetSign) {
        self.sign = sign;
        let delta = sign.factor().saturating_mul(self.offset_ns.min(i64::MAX as u64) as i64);
        self.aligned_events_ns = self
            .raw_events_ns
            .iter()
            .map(|&t| t.saturating_add(delta))
            .collect();
    }
}

/// Pick the sign under which `target ± offset` best matches `reference`,
/// by median absolute difference over the common prefix. Ties and empty
/// inputs give [`OffsetSign::Plus`].
pub fn resolve_sign(reference: &[i64], target: &[i64], offset_ns: u64) -> OffsetSign {
    let n = reference.len().min(target.len());
    if n == 0 {
        return OffsetSign::Plus;
    }
    let offset = offset_ns.min(i64::MAX as u64) as i64;
    let residual = |sign: i64| {
        let diffs: Vec<f64> = reference[..n]
            .iter()
            .zip(&target[..n])
            .map(|(&r, &t)| (t as f64 + (sign * offset) as f64 - r as f64).abs())
            .collect();
        median(diffs)
    };
    if residual(1) <= residual(-1) {
        OffsetSign::Plus
    } else {
        OffsetSign::Minus
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Absolute start time of a stream: the rounded mean of
/// `reference[k] - rel_times[k]` over the common prefix. `None` when there
/// is nothing to fit.
pub fn estimate_t0(reference_ns: &[i64], rel_times_ns: &[i64]) -> Option<i64> {
    let n = reference_ns.len().min(rel_times_ns.len());
    if n == 0 {
        return None;
    }
    let sum: f64 = reference_ns[..n]
        .iter()
        .zip(&rel_times_ns[..n])
        .map(|(&a, &r)| a as f64 - r as f64)
        .sum();
    Some((sum / n as f64).round() as i64)
}

/// Choose the reference device: `requested` if it has events, otherwise
/// the lexicographically smallest device with events.
pub fn choose_reference<'a>(
    devices: impl IntoIterator<Item = (&'a str, usize)>,
    requested: Option<&str>,
) -> SyncResult<String> {
    let with_events: Vec<&str> = devices
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(name, _)| name)
        .collect();

    if let Some(name) = requested {
        return if with_events.contains(&name) {
            Ok(name.to_string())
        } else {
            Err(SyncError::ValidationInput(format!(
                "reference device {name:?} has no flash events"
            )))
        };
    }
    with_events
        .into_iter()
        .min()
        .map(str::to_string)
        .ok_or_else(|| SyncError::ValidationInput("no device has flash events".into()))
}

/// Put every device on the hub clock.
///
/// `stored_offsets` are the signed offsets from session metadata, matched
/// to devices by name. The reference keeps the sign of its stored offset;
/// every other device takes the sign that best matches the reference's
/// aligned events.
pub fn align_devices(
    raw_events: &BTreeMap<String, Vec<i64>>,
    stored_offsets: &BTreeMap<String, i64>,
    requested_reference: Option<&str>,
) -> SyncResult<(String, Vec<DeviceOffset>)> {
    let reference = choose_reference(
        raw_events.iter().map(|(name, ev)| (name.as_str(), ev.len())),
        requested_reference,
    )?;

    let mut devices: Vec<DeviceOffset> = raw_events
        .iter()
        .map(|(name, events)| {
            let stored = stored_offsets.get(name).copied().unwrap_or(0);
            let mut device = DeviceOffset::new(name.clone(), stored.unsigned_abs(), events.clone());
            device.apply(OffsetSign::of(stored));
            device
        })
        .collect();

    let reference_aligned = devices
        .iter()
        .find(|d| d.name == reference)
        .map(|d| d.aligned_events_ns.clone())
        .unwrap_or_default();

    for device in devices.iter_mut().filter(|d| d.name != reference) {
        if device.raw_events_ns.is_empty() {
            continue;
        }
        let sign = resolve_sign(&reference_aligned, &device.raw_events_ns, device.offset_ns);
        device.apply(sign);
    }

    Ok((reference, devices))
}

/// Outcome of one validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    /// Device whose events define the event schedule.
    pub reference: Option<String>,
    /// Max minus min of all time estimates for each event, in ms.
    pub per_event_spread_ms: Vec<f64>,
    pub overall_max_ms: f64,
    pub passed: bool,
    pub tolerance_ms: f64,
    /// Fitted start time per usable stream.
    pub t0_by_stream: BTreeMap<String, i64>,
    /// Streams without peaks or frame rate.
    pub excluded_streams: Vec<String>,
}

/// Compare every device's aligned events and every stream's predicted
/// flash times, event by event.
///
/// `reference` names the device whose events fix the event count and the
/// `T0` fit; when `None` (or absent from `aligned_by_device`) the smallest
/// device name with events is used. An event to which nothing contributes
/// gets an infinite spread, and a run with no events fails.
pub fn compute_validation_report(
    aligned_by_device: &BTreeMap<String, Vec<i64>>,
    detections: &BTreeMap<String, StreamDetection>,
    reference: Option<&str>,
    tolerance_ms: f64,
) -> ValidationResult {
    let reference = reference
        .filter(|r| aligned_by_device.get(*r).is_some_and(|ev| !ev.is_empty()))
        .map(str::to_string)
        .or_else(|| {
            aligned_by_device
                .iter()
                .find(|(_, ev)| !ev.is_empty())
                .map(|(name, _)| name.clone())
        });

    let reference_events: &[i64] = reference
        .as_deref()
        .and_then(|r| aligned_by_device.get(r))
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut t0_by_stream = BTreeMap::new();
    let mut predicted: Vec<Vec<i64>> = Vec::new();
    let mut excluded_streams = Vec::new();
    for (name, det) in detections {
        let rel = det.rel_times_ns();
        match estimate_t0(reference_events, &rel) {
            Some(t0) if det.is_usable() => {
                t0_by_stream.insert(name.clone(), t0);
                predicted.push(rel.iter().map(|r| t0 + r).collect());
            }
            _ => excluded_streams.push(name.clone()),
        }
    }

    let per_event_spread_ms: Vec<f64> = (0..reference_events.len())
        .map(|k| {
            let estimates = aligned_by_device
                .values()
                .filter_map(|ev| ev.get(k))
                .chain(predicted.iter().filter_map(|p| p.get(k)));
            let (lo, hi) = estimates.fold((i64::MAX, i64::MIN), |(lo, hi), &t| {
                (lo.min(t), hi.max(t))
            });
            if lo > hi {
                f64::INFINITY
            } else {
                (hi - lo) as f64 / 1e6
            }
        })
        .collect();

    let overall_max_ms = per_event_spread_ms
        .iter()
        .copied()
        .reduce(f64::max)
        .unwrap_or(f64::INFINITY);
    let passed = !per_event_spread_ms.is_empty() && overall_max_ms <= tolerance_ms;

    ValidationResult {
        reference,
        per_event_spread_ms,
        overall_max_ms,
        passed,
        tolerance_ms,
        t0_by_stream,
        excluded_streams,
    }
}
