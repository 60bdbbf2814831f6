//! Rolling-window analytics over the decoded reading stream.
//!
//! The engine owns two bounded, time-ordered sample windows (bpm and RR) and
//! computes point-in-time statistics over a trailing window on demand.
//! Nothing is stored beyond the retention horizon; snapshots are never cached.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

/// Smallest accepted analysis window, in seconds.
pub const MIN_WINDOW_SECS: u64 = 10;

/// Sub-window used for the short-term rate estimate, in seconds.
const RATE_SUB_WINDOW_SECS: i64 = 5;

/// Longest gap between two consecutive samples that still counts as time
/// spent in a zone, in seconds.
const MAX_ZONE_GAP_SECS: f64 = 10.0;

/// Floor for elapsed-time divisions.
const MIN_ELAPSED_SECS: f64 = 1e-3;

/// Zone bucket boundaries on bpm. A bpm below the first bound is "rest",
/// at or above the last bound is "peak".
const ZONE_BOUNDS: [u16; 4] = [90, 110, 130, 150];

/// One bpm observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BpmSample {
    pub timestamp: DateTime<Utc>,
    pub bpm: u16,
}

/// One RR observation. `is_estimated` marks samples synthesized from bpm
/// because the device sent no real RR data in that notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrSample {
    pub timestamp: DateTime<Utc>,
    pub interval_ms: u32,
    pub is_estimated: bool,
}

/// Seconds spent in each heart-rate zone within the analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSeconds {
    /// bpm below 90
    pub rest: f64,
    /// bpm in [90, 110)
    pub light: f64,
    /// bpm in [110, 130)
    pub moderate: f64,
    /// bpm in [130, 150)
    pub vigorous: f64,
    /// bpm at or above 150
    pub peak: f64,
}

impl ZoneSeconds {
    pub fn total(&self) -> f64 {
        self.rest + self.light + self.moderate + self.vigorous + self.peak
    }
}

/// Heart-rate-variability measures over the RR slice of the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HrvSummary {
    /// Number of RR samples in the window.
    pub rr_count: usize,
    /// True when every RR value in the slice is identical, which only happens
    /// for values synthesized from bpm. SDNN/RMSSD are withheld in that case.
    pub rr_estimated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdnn_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rmssd_ms: Option<f64>,
}

/// Aggregate view over one analysis window, computed on demand.
///
/// `from`/`to` are the timestamps of the first and last bpm sample actually
/// included, not the nominal window bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub count: usize,
    pub bpm_min: u16,
    pub bpm_max: u16,
    pub bpm_avg: f64,
    pub bpm_stddev: f64,
    /// Net bpm change per second across the whole window.
    pub rate_per_sec: f64,
    /// Net bpm change per second across the trailing five seconds; 0 when
    /// that sub-slice holds fewer than two samples.
    pub rate_per_5sec: f64,
    /// Z-score of the most recent sample against the window mean; 0 when the
    /// window has no spread.
    pub z_score: f64,
    pub zone_seconds: ZoneSeconds,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hrv: Option<HrvSummary>,
}

/// Retention and window-size limits for a [`MetricsEngine`].
#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    /// Largest analysis window callers may request, in seconds.
    pub max_window_secs: u64,
    /// Extra retention kept beyond the largest window, in seconds.
    pub retention_margin_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            max_window_secs: 300,
            retention_margin_secs: 30,
        }
    }
}

/// Rolling metrics engine.
///
/// Each window sits behind its own mutex, held only for the duration of a
/// single push, prune, or copy-out. Correctness needs atomicity per
/// operation, not consistency across the two windows.
#[derive(Debug)]
pub struct MetricsEngine {
    bpm_window: Mutex<VecDeque<BpmSample>>,
    rr_window: Mutex<VecDeque<RrSample>>,
    retention: ChronoDuration,
    max_window_secs: u64,
}

impl MetricsEngine {
    pub fn new(config: MetricsConfig) -> Self {
        let horizon = config.max_window_secs + config.retention_margin_secs;
        MetricsEngine {
            bpm_window: Mutex::new(VecDeque::new()),
            rr_window: Mutex::new(VecDeque::new()),
            retention: ChronoDuration::seconds(horizon as i64),
            max_window_secs: config.max_window_secs.max(MIN_WINDOW_SECS),
        }
    }

    /// Append one reading to the windows and prune both to the retention
    /// horizon.
    ///
    /// An empty `rr_intervals_ms` appends a single synthetic RR sample of
    /// `round(60000 / bpm)` ms, flagged estimated, purely to keep time-series
    /// continuity for charts.
    pub fn push(&self, timestamp: DateTime<Utc>, bpm: u16, rr_intervals_ms: &[u32]) {
        let cutoff = timestamp - self.retention;

        {
            let mut window = self
                .bpm_window
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            window.push_back(BpmSample { timestamp, bpm });
            while window.front().is_some_and(|s| s.timestamp < cutoff) {
                window.pop_front();
            }
        }

        {
            let mut window = self.rr_window.lock().unwrap_or_else(|e| e.into_inner());
            if rr_intervals_ms.is_empty() {
                window.push_back(RrSample {
                    timestamp,
                    interval_ms: estimated_rr_ms(bpm),
                    is_estimated: true,
                });
            } else {
                for &interval_ms in rr_intervals_ms {
                    window.push_back(RrSample {
                        timestamp,
                        interval_ms,
                        is_estimated: false,
                    });
                }
            }
            while window.front().is_some_and(|s| s.timestamp < cutoff) {
                window.pop_front();
            }
        }
    }

    /// Statistics over the trailing `window_secs`, ending now.
    /// `None` when the window holds fewer than two bpm samples.
    pub fn compute_stats(&self, window_secs: u64) -> Option<StatsSnapshot> {
        self.compute_stats_at(window_secs, Utc::now())
    }

    /// As [`compute_stats`](Self::compute_stats) with an explicit window end.
    pub fn compute_stats_at(&self, window_secs: u64, now: DateTime<Utc>) -> Option<StatsSnapshot> {
        let window_secs = window_secs.clamp(MIN_WINDOW_SECS, self.max_window_secs);
        let cutoff = now - ChronoDuration::seconds(window_secs as i64);

        let samples: Vec<BpmSample> = {
            let window = self.bpm_window.lock().unwrap_or_else(|e| e.into_inner());
            window.iter().filter(|s| s.timestamp >= cutoff).copied().collect()
        };
        if samples.len() < 2 {
            return None;
        }

        let first = samples[0];
        let last = samples[samples.len() - 1];
        let count = samples.len();

        let bpm_min = samples.iter().map(|s| s.bpm).min().unwrap_or(0);
        let bpm_max = samples.iter().map(|s| s.bpm).max().unwrap_or(0);
        let mean = samples.iter().map(|s| f64::from(s.bpm)).sum::<f64>() / count as f64;
        let variance = samples
            .iter()
            .map(|s| {
                let d = f64::from(s.bpm) - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;
        let stddev = variance.sqrt();

        let rate_per_sec = bpm_rate(&samples);

        let sub_cutoff = now - ChronoDuration::seconds(RATE_SUB_WINDOW_SECS);
        let sub_slice: Vec<BpmSample> = samples
            .iter()
            .filter(|s| s.timestamp >= sub_cutoff)
            .copied()
            .collect();
        let rate_per_5sec = if sub_slice.len() >= 2 {
            bpm_rate(&sub_slice)
        } else {
            0.0
        };

        let z_score = if stddev > f64::EPSILON {
            (f64::from(last.bpm) - mean) / stddev
        } else {
            0.0
        };

        let mut zone_seconds = ZoneSeconds::default();
        for pair in samples.windows(2) {
            let gap = elapsed_secs(pair[0].timestamp, pair[1].timestamp)
                .clamp(0.0, MAX_ZONE_GAP_SECS);
            // Time between samples is attributed to the earlier sample's zone.
            match zone_index(pair[0].bpm) {
                0 => zone_seconds.rest += gap,
                1 => zone_seconds.light += gap,
                2 => zone_seconds.moderate += gap,
                3 => zone_seconds.vigorous += gap,
                _ => zone_seconds.peak += gap,
            }
        }

        let hrv = self.compute_hrv(cutoff);

        Some(StatsSnapshot {
            from: first.timestamp,
            to: last.timestamp,
            count,
            bpm_min,
            bpm_max,
            bpm_avg: mean,
            bpm_stddev: stddev,
            rate_per_sec,
            rate_per_5sec,
            z_score,
            zone_seconds,
            hrv,
        })
    }

    fn compute_hrv(&self, cutoff: DateTime<Utc>) -> Option<HrvSummary> {
        let intervals: Vec<f64> = {
            let window = self.rr_window.lock().unwrap_or_else(|e| e.into_inner());
            window
                .iter()
                .filter(|s| s.timestamp >= cutoff)
                .map(|s| f64::from(s.interval_ms))
                .collect()
        };
        if intervals.len() < 2 {
            return None;
        }

        // A slice without any spread can only come from per-beat estimates
        // synthesized out of bpm; never report HRV computed from those.
        let all_identical = intervals.iter().all(|&v| v == intervals[0]);
        if all_identical {
            return Some(HrvSummary {
                rr_count: intervals.len(),
                rr_estimated: true,
                sdnn_ms: None,
                rmssd_ms: None,
            });
        }

        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let sdnn = (intervals.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt();
        let rmssd = (intervals
            .windows(2)
            .map(|p| (p[1] - p[0]) * (p[1] - p[0]))
            .sum::<f64>()
            / (n - 1.0))
            .sqrt();

        Some(HrvSummary {
            rr_count: intervals.len(),
            rr_estimated: false,
            sdnn_ms: Some(sdnn),
            rmssd_ms: Some(rmssd),
        })
    }

    /// Raw (timestamp, bpm) pairs within the trailing window, in time order.
    pub fn history(&self, window_secs: u64) -> Vec<BpmSample> {
        self.history_at(window_secs, Utc::now())
    }

    /// As [`history`](Self::history) with an explicit window end.
    pub fn history_at(&self, window_secs: u64, now: DateTime<Utc>) -> Vec<BpmSample> {
        let window_secs = window_secs.clamp(MIN_WINDOW_SECS, self.max_window_secs);
        let cutoff = now - ChronoDuration::seconds(window_secs as i64);
        let window = self.bpm_window.lock().unwrap_or_else(|e| e.into_inner());
        window.iter().filter(|s| s.timestamp >= cutoff).copied().collect()
    }

    /// Current (bpm, RR) window lengths, for diagnostics and tests.
    pub fn window_sizes(&self) -> (usize, usize) {
        let bpm = self.bpm_window.lock().unwrap_or_else(|e| e.into_inner()).len();
        let rr = self.rr_window.lock().unwrap_or_else(|e| e.into_inner()).len();
        (bpm, rr)
    }
}

/// Synthetic per-beat interval for a notification without RR data.
fn estimated_rr_ms(bpm: u16) -> u32 {
    let bpm = u32::from(bpm.max(1));
    (60_000 + bpm / 2) / bpm
}

fn zone_index(bpm: u16) -> usize {
    ZONE_BOUNDS.iter().take_while(|&&bound| bpm >= bound).count()
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Net bpm change per second between the first and last sample of a slice.
fn bpm_rate(samples: &[BpmSample]) -> f64 {
    let first = samples[0];
    let last = samples[samples.len() - 1];
    let elapsed = elapsed_secs(first.timestamp, last.timestamp).max(MIN_ELAPSED_SECS);
    (f64::from(last.bpm) - f64::from(first.bpm)) / elapsed
}
