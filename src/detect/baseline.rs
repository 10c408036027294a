//! Rolling per-stream baseline: a time-bounded window with streaming
//! mean/variance (Welford) that supports removal as entries age out.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Removals accumulate rounding error; rebuild the moments from the window
/// this often.
const RECOMPUTE_EVERY: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowEntry {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct Baseline {
    window_size: Duration,
    window: VecDeque<WindowEntry>,
    mean: f64,
    m2: f64,
    removals: u32,
    /// When a sample for this stream last arrived, by the local clock.
    last_arrival: Option<Instant>,
}

/// Point-in-time copy of a baseline's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaselineSnapshot {
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
    pub sample_count: u64,
    pub newest: Option<DateTime<Utc>>,
}

impl Baseline {
    pub fn new(window_size: Duration) -> Self {
        Self {
            window_size,
            window: VecDeque::new(),
            mean: 0.0,
            m2: 0.0,
            removals: 0,
            last_arrival: None,
        }
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    pub fn sample_count(&self) -> u64 {
        self.window.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n - 1 denominator); zero below two samples.
    pub fn variance(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        (self.m2 / (n - 1) as f64).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.window.back().map(|e| e.timestamp)
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.window.iter()
    }

    pub fn values(&self) -> Vec<f64> {
        self.window.iter().map(|e| e.value).collect()
    }

    pub fn snapshot(&self) -> BaselineSnapshot {
        BaselineSnapshot {
            mean: self.mean,
            variance: self.variance(),
            stddev: self.stddev(),
            sample_count: self.sample_count(),
            newest: self.newest(),
        }
    }

    /// Whether `ts` is too old to be scored against this baseline.
    pub fn is_stale(&self, ts: DateTime<Utc>) -> bool {
        match self.newest() {
            Some(newest) => ts < newest - self.window_size,
            None => false,
        }
    }

    /// Record that a sample for this stream arrived at `at`.
    pub fn touch(&mut self, at: Instant) {
        self.last_arrival = Some(at);
    }

    /// Nothing has arrived for two windows. Measured per stream against the
    /// local clock, so one stream's skewed timestamps cannot age out another.
    pub fn is_idle(&self, now: Instant) -> bool {
        let Some(at) = self.last_arrival else {
            return true;
        };
        let Ok(limit) = (self.window_size * 2).to_std() else {
            return false;
        };
        now.saturating_duration_since(at) > limit
    }

    /// Remove the entry with exactly this timestamp, returning its value.
    pub fn remove_at(&mut self, ts: DateTime<Utc>) -> Option<f64> {
        let idx = self.window.binary_search_by_key(&ts, |e| e.timestamp).ok()?;
        let entry = self.window.remove(idx)?;
        self.unfold(entry.value);
        Some(entry.value)
    }

    /// Insert keeping timestamp order, then age out anything older than
    /// `window_size` relative to the newest entry.
    pub fn insert(&mut self, ts: DateTime<Utc>, value: f64) {
        let entry = WindowEntry { timestamp: ts, value };
        match self.window.back() {
            Some(last) if last.timestamp > ts => {
                let idx = self.window.partition_point(|e| e.timestamp <= ts);
                self.window.insert(idx, entry);
            }
            _ => self.window.push_back(entry),
        }
        self.fold(value);
        self.evict_expired();
    }

    fn evict_expired(&mut self) {
        let Some(newest) = self.newest() else { return };
        let cutoff = newest - self.window_size;
        while let Some(front) = self.window.front() {
            if front.timestamp >= cutoff {
                break;
            }
            if let Some(old) = self.window.pop_front() {
                self.unfold(old.value);
            }
        }
    }

    fn fold(&mut self, x: f64) {
        let n = self.window.len() as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (x - self.mean);
    }

    /// Inverse Welford step. Must be called after the entry left `window`.
    fn unfold(&mut self, x: f64) {
        let n = self.window.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let old_mean = self.mean;
        self.mean = old_mean - (x - old_mean) / n as f64;
        self.m2 = (self.m2 - (x - old_mean) * (x - self.mean)).max(0.0);

        self.removals += 1;
        if self.removals >= RECOMPUTE_EVERY {
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        self.removals = 0;
        let n = self.window.len() as f64;
        if n == 0.0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        self.mean = self.window.iter().map(|e| e.value).sum::<f64>() / n;
        self.m2 = self
            .window
            .iter()
            .map(|e| (e.value - self.mean).powi(2))
            .sum();
    }
}
