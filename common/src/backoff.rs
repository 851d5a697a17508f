//! Exponential retry schedules for reconnect logic.

use std::time::Duration;

use rand::Rng;

/// Growth factor used by [`schedule`].
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Upper bound on up-front allocation; longer schedules grow as they fill.
const MAX_PREALLOC: usize = 1024;

/// Retry delays in milliseconds: `base_ms`, then each previous delay times
/// two. Returns an empty schedule when `count <= 0`.
pub fn schedule(base_ms: u64, count: i64) -> Vec<u64> {
    schedule_with_factor(base_ms, count, DEFAULT_FACTOR)
}

/// Like [`schedule`] with an explicit growth factor.
///
/// Every delay is at least 1 ms and the sequence never decreases, so factors
/// below 1.0 are treated as 1.0.
pub fn schedule_with_factor(base_ms: u64, count: i64, factor: f64) -> Vec<u64> {
    if count <= 0 {
        return Vec::new();
    }
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    let mut delays = Vec::with_capacity(count.min(MAX_PREALLOC));
    delays.extend(delays_from(base_ms, factor).take(count));
    delays
}

/// Endless form of [`schedule_with_factor`], saturating at `u64::MAX`.
pub fn delays_from(base_ms: u64, factor: f64) -> impl Iterator<Item = u64> {
    let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
    std::iter::successors(Some(base_ms.max(1)), move |&delay| {
        let next = (delay as f64 * factor).round();
        Some(if next >= u64::MAX as f64 {
            u64::MAX
        } else {
            (next as u64).max(delay)
        })
    })
}

/// `delay_ms` plus a uniform random jitter in `0..=max_jitter_ms`.
pub fn with_jitter(delay_ms: u64, max_jitter_ms: u64) -> Duration {
    let jitter = if max_jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_jitter_ms)
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}
