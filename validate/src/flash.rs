//! Flash detection in per-frame brightness sequences.
//!
//! A flash shows up as a jump in mean frame brightness. Ambient light drifts
//! over a long capture, so instead of a fixed threshold each frame is scored
//! by a blend of its brightness z-score and the z-score of its first
//! difference, and the best-scoring frames are picked greedily with
//! neighbourhood suppression.

use serde::{Deserialize, Serialize};

/// Default half-width, in frames, of the suppression window around a peak.
pub const DEFAULT_MIN_SEPARATION: usize = 3;

/// Weight of the brightness z-score in the blended score; the first
/// difference gets the rest.
const BRIGHTNESS_WEIGHT: f64 = 0.6;
const DERIVATIVE_WEIGHT: f64 = 0.4;

/// Accepted peaks must score at least this, or the 90th percentile of all
/// scores when that is higher.
const MIN_PROMINENCE: f64 = 2.5;
const PROMINENCE_PERCENTILE: f64 = 90.0;

/// Detected flash frames of one video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDetection {
    pub name: String,
    /// Ascending frame indices.
    pub frame_indices: Vec<usize>,
    pub fps: f64,
}

impl StreamDetection {
    /// Whether this stream can place its peaks on a timeline.
    pub fn is_usable(&self) -> bool {
        self.fps > 0.0 && !self.frame_indices.is_empty()
    }

    /// Time of each peak relative to the first frame, in ns (truncated).
    /// Empty when `fps` is not positive.
    pub fn rel_times_ns(&self) -> Vec<i64> {
        if !(self.fps > 0.0) {
            return Vec::new();
        }
        self.frame_indices
            .iter()
            .map(|&i| (i as f64 / self.fps * 1e9) as i64)
            .collect()
    }
}

/// Indices of up to `n_events` flash frames in `brightness`, ascending.
///
/// Frames within `min_separation` of an accepted peak are not considered
/// again, so one flash spanning several frames yields one index. Accepted
/// peaks below the prominence floor are dropped, so fewer than `n_events`
/// indices may come back. Ties in score keep the earlier frame first.
pub fn detect_flash_indices(brightness: &[f64], n_events: usize, min_separation: usize) -> Vec<usize> {
    if n_events == 0 || brightness.is_empty() {
        return Vec::new();
    }

    let scores = blended_scores(brightness);

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut visited = vec![false; scores.len()];
    let mut selected = Vec::with_capacity(n_events);
    for idx in order {
        if selected.len() >= n_events {
            break;
        }
        if visited[idx] {
            continue;
        }
        selected.push(idx);
        let lo = idx.saturating_sub(min_separation);
        let hi = (idx + min_separation + 1).min(visited.len());
        visited[lo..hi].iter_mut().for_each(|v| *v = true);
    }
    selected.sort_unstable();

    let floor = MIN_PROMINENCE.max(percentile(&scores, PROMINENCE_PERCENTILE));
    selected.retain(|&i| scores[i] >= floor);
    selected.truncate(n_events);
    selected
}

/// `0.6 * z(brightness) + 0.4 * z(diff(brightness))` per frame, where the
/// first difference of frame 0 is zero.
fn blended_scores(x: &[f64]) -> Vec<f64> {
    let z = zscores(x);
    let diff: Vec<f64> = std::iter::once(0.0)
        .chain(x.windows(2).map(|w| w[1] - w[0]))
        .collect();
    let sigma = nonzero(population_std(&diff));
    z.iter()
        .zip(&diff)
        .map(|(z, d)| BRIGHTNESS_WEIGHT * z + DERIVATIVE_WEIGHT * (d / sigma))
        .collect()
}

fn zscores(x: &[f64]) -> Vec<f64> {
    let mu = mean(x);
    let sigma = nonzero(population_std(x));
    x.iter().map(|v| (v - mu) / sigma).collect()
}

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

fn population_std(x: &[f64]) -> f64 {
    let mu = mean(x);
    (x.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
}

/// A flat signal has no spread; score it in raw units.
fn nonzero(sigma: f64) -> f64 {
    if sigma == 0.0 || !sigma.is_finite() {
        1.0
    } else {
        sigma
    }
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(x: &[f64], p: f64) -> f64 {
    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}
