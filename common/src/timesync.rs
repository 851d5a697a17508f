//! Clock-offset estimation between a device and the hub.
//!
//! One exchange yields four timestamps: `t0` (device sends), `t1` (hub
//! receives), `t2` (hub replies) and `t3` (device receives). From them:
//!
//! ```text
//! offset = ((t1 - t0) + (t2 - t3)) / 2
//! delay  = (t3 - t0) - (t2 - t1)
//! ```
//!
//! The offset is hub clock minus device clock. Network asymmetry can bias
//! it by up to half the delay, so the estimator keeps the trials with the
//! smallest delay.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::now_ns;

/// Result of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncSample {
    pub offset_ns: i64,
    pub delay_ns: i64,
}

/// Offset and delay from the four exchange timestamps.
pub fn compute_time_sync(t0: i64, t1: i64, t2: i64, t3: i64) -> TimeSyncSample {
    TimeSyncSample {
        offset_ns: ((t1 - t0) + (t2 - t3)).div_euclid(2),
        delay_ns: (t3 - t0) - (t2 - t1),
    }
}

/// Per-device outcome of a multi-trial estimation, as stored in
/// `session_metadata.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncStats {
    /// Offset of the minimal-delay trial(s).
    pub offset_ns: i64,
    /// Smallest observed delay.
    pub delay_ns: i64,
    /// Population standard deviation of all trial offsets.
    #[serde(alias = "std_dev")]
    pub std_dev_ns: i64,
    pub trials: u32,
    /// Wall-clock time of the estimation.
    pub timestamp_ns: i64,
}

/// Combine trials into [`TimeSyncStats`]. `None` when there are no samples.
pub fn aggregate(samples: &[TimeSyncSample], timestamp_ns: i64) -> Option<TimeSyncStats> {
    let min_delay = samples.iter().map(|s| s.delay_ns).min()?;

    let best: Vec<i64> = samples
        .iter()
        .filter(|s| s.delay_ns == min_delay)
        .map(|s| s.offset_ns)
        .collect();
    let offset = best.iter().map(|&o| o as f64).sum::<f64>() / best.len() as f64;

    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| s.offset_ns as f64).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|s| (s.offset_ns as f64 - mean).powi(2))
        .sum::<f64>()
        / n;

    Some(TimeSyncStats {
        offset_ns: offset.round() as i64,
        delay_ns: min_delay,
        std_dev_ns: var.sqrt().round() as i64,
        trials: samples.len() as u32,
        timestamp_ns,
    })
}

/// What the hub reports for one `time_sync` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncReply {
    /// Hub clock when the request arrived (`t1`).
    pub server_timestamp: i64,
    /// How long the hub held the request (`t2 - t1`).
    pub hold_ns: i64,
}

/// One request/response exchange with the hub.
pub trait TimeSyncExchange {
    fn exchange(&mut self, seq: u64, t0: i64) -> Result<TimeSyncReply>;
}

/// Runs repeated exchanges and keeps the least-delayed estimate.
#[derive(Debug, Clone)]
pub struct ClockOffsetEstimator {
    pub trials: u32,
    /// Pause between trials so they do not arrive as one burst.
    pub pacing: Duration,
}

impl Default for ClockOffsetEstimator {
    fn default() -> Self {
        Self {
            trials: 12,
            pacing: Duration::from_millis(5),
        }
    }
}

impl ClockOffsetEstimator {
    pub fn new(trials: u32) -> Self {
        Self {
            trials,
            ..Self::default()
        }
    }

    /// Estimate against `conn` using the local wall clock.
    pub fn estimate<C: TimeSyncExchange>(&self, conn: &mut C) -> Result<TimeSyncStats> {
        self.estimate_with_clock(conn, now_ns)
    }

    /// Estimate against `conn`, reading local time from `clock`.
    ///
    /// Failed trials are logged and skipped; it is an error only when no
    /// trial succeeds.
    pub fn estimate_with_clock<C, F>(&self, conn: &mut C, mut clock: F) -> Result<TimeSyncStats>
    where
        C: TimeSyncExchange,
        F: FnMut() -> i64,
    {
        let mut samples = Vec::with_capacity(self.trials as usize);

        for seq in 1..=u64::from(self.trials.max(1)) {
            let t0 = clock();
            let reply = match conn.exchange(seq, t0) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Time sync trial {seq} failed: {e:#}");
                    continue;
                }
            };
            let t3 = clock();

            let t1 = reply.server_timestamp;
            let t2 = t1 + reply.hold_ns.max(0);
            let sample = compute_time_sync(t0, t1, t2, t3);
            debug!(
                "Time sync trial {seq}: offset={}ns delay={}ns",
                sample.offset_ns, sample.delay_ns
            );
            samples.push(sample);

            if !self.pacing.is_zero() {
                std::thread::sleep(self.pacing);
            }
        }

        let Some(stats) = aggregate(&samples, clock()) else {
            bail!("no valid time sync samples out of {} trials", self.trials);
        };
        info!(
            "Time sync: offset={}ns min_delay={}ns std_dev={}ns trials={}",
            stats.offset_ns, stats.delay_ns, stats.std_dev_ns, stats.trials
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_time_sync_symmetric() {
        // Hub is 1000ns ahead, 100ns each way, 10ns hold.
        let s = compute_time_sync(0, 1100, 1110, 210);
        assert_eq!(s.offset_ns, 1000);
        assert_eq!(s.delay_ns, 200);
    }

    #[test]
    fn test_zero_hold_matches_half_rtt_formula() {
        let (t0, server, t3) = (5_000, 9_000, 5_400);
        let s = compute_time_sync(t0, server, server, t3);
        assert_eq!(s.offset_ns, server - t0 - (t3 - t0) / 2);
    }

    #[test]
    fn test_aggregate_prefers_min_delay() {
        let samples = [
            TimeSyncSample { offset_ns: 1_500, delay_ns: 900 },
            TimeSyncSample { offset_ns: 1_000, delay_ns: 100 },
            TimeSyncSample { offset_ns: 1_100, delay_ns: 100 },
            TimeSyncSample { offset_ns: 800, delay_ns: 400 },
        ];
        let stats = aggregate(&samples, 42).unwrap();
        assert_eq!(stats.offset_ns, 1_050);
        assert_eq!(stats.delay_ns, 100);
        assert_eq!(stats.trials, 4);
        assert_eq!(stats.timestamp_ns, 42);
        // offsets mean 1100, deviations 400, -100, 0, -300
        assert_eq!(stats.std_dev_ns, 255);
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(aggregate(&[], 0).is_none());
    }

    /// Hub whose clock runs `offset` ahead, with a fixed one-way latency
    /// that advances the shared fake clock.
    struct FakeHub {
        offset: i64,
        latency: i64,
        now: std::rc::Rc<std::cell::Cell<i64>>,
        fail_first: bool,
    }

    impl TimeSyncExchange for FakeHub {
        fn exchange(&mut self, _seq: u64, _t0: i64) -> Result<TimeSyncReply> {
            if self.fail_first {
                self.fail_first = false;
                bail!("connection reset");
            }
            self.now.set(self.now.get() + self.latency);
            let server_timestamp = self.now.get() + self.offset;
            self.now.set(self.now.get() + self.latency);
            Ok(TimeSyncReply {
                server_timestamp,
                hold_ns: 0,
            })
        }
    }

    #[test]
    fn test_estimator_recovers_offset() {
        let now = std::rc::Rc::new(std::cell::Cell::new(1_000_000_i64));
        let mut hub = FakeHub {
            offset: 5_000_000,
            latency: 200_000,
            now: now.clone(),
            fail_first: true,
        };
        let estimator = ClockOffsetEstimator {
            trials: 5,
            pacing: Duration::ZERO,
        };
        let stats = estimator
            .estimate_with_clock(&mut hub, || now.get())
            .unwrap();
        assert_eq!(stats.offset_ns, 5_000_000);
        assert_eq!(stats.delay_ns, 400_000);
        assert_eq!(stats.std_dev_ns, 0);
        assert_eq!(stats.trials, 4);
    }

    #[test]
    fn test_stats_accept_legacy_std_dev_key() {
        let json = r#"{"offset_ns":1,"delay_ns":2,"std_dev":3,"trials":4,"timestamp_ns":5}"#;
        let stats: TimeSyncStats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.std_dev_ns, 3);
    }
}
