//! Streaming z-score engine over per-stream rolling baselines.

use std::collections::HashMap;

use chrono::Duration;
use serde::Serialize;
use tokio::time::Instant;

use crate::detect::baseline::{Baseline, BaselineSnapshot};
use crate::detect::DetectError;
use crate::metrics::{MetricSample, StreamKey};

/// Floor for the standard deviation in the z-score denominator.
pub const EPSILON: f64 = 1e-9;

/// Largest magnitude a score may take. A deviation from a perfectly flat
/// baseline lands here instead of overflowing.
pub const MAX_SCORE: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreResult {
    pub score: f64,
    pub confidence: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
}

/// A scoring strategy. Implementations own all per-stream state for the
/// keys routed to them and are driven from a single task, so they need no
/// interior locking.
pub trait Scorer: Send {
    fn ingest(&mut self, sample: &MetricSample) -> Result<ScoreResult, DetectError>;

    /// Drop state for streams that have received no samples for two
    /// windows as of `now`. Returns how many streams were dropped.
    fn evict_idle(&mut self, now: Instant) -> usize;

    fn stream_count(&self) -> usize;

    fn stats(&self) -> EngineStats;
}

/// Counters reported by `GET /api/v1/status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub samples_scored: u64,
    pub stale_rejected: u64,
    pub baselines_evicted: u64,
}

pub struct ScoringEngine {
    window_size: Duration,
    min_samples_for_confidence: u64,
    baselines: HashMap<StreamKey, Baseline>,
    stats: EngineStats,
}

impl ScoringEngine {
    pub fn new(window_size: Duration, min_samples_for_confidence: u64) -> Self {
        Self {
            window_size,
            min_samples_for_confidence: min_samples_for_confidence.max(1),
            baselines: HashMap::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn baseline(&self, key: &StreamKey) -> Option<&Baseline> {
        self.baselines.get(key)
    }

    pub fn snapshot(&self, key: &StreamKey) -> Option<BaselineSnapshot> {
        self.baselines.get(key).map(Baseline::snapshot)
    }

    fn confidence(&self, sample_count: u64) -> f64 {
        (sample_count as f64 / self.min_samples_for_confidence as f64).min(1.0)
    }
}

/// `(value - mean) / max(stddev, EPSILON)`, bounded to `±MAX_SCORE`.
pub fn z_score(value: f64, mean: f64, stddev: f64) -> f64 {
    let z = (value - mean) / stddev.max(EPSILON);
    z.clamp(-MAX_SCORE, MAX_SCORE)
}

impl Scorer for ScoringEngine {
    fn ingest(&mut self, sample: &MetricSample) -> Result<ScoreResult, DetectError> {
        sample.check_finite()?;
        let key = sample.key();
        let window_size = self.window_size;

        if let Some(baseline) = self.baselines.get(&key) {
            if baseline.is_stale(sample.timestamp) {
                self.stats.stale_rejected += 1;
                let newest = baseline.newest().unwrap_or(sample.timestamp);
                tracing::debug!(stream = %key, ts = %sample.timestamp, %newest, "Rejected stale sample");
                return Err(DetectError::StaleSample {
                    key,
                    timestamp: sample.timestamp,
                    newest,
                    window_secs: window_size.num_seconds(),
                });
            }
        }

        let baseline = self
            .baselines
            .entry(key)
            .or_insert_with(|| Baseline::new(window_size));

        // Same timestamp again: the later sample replaces the earlier one.
        if let Some(prev) = baseline.remove_at(sample.timestamp) {
            tracing::debug!(ts = %sample.timestamp, prev, new = sample.value, "Replacing duplicate timestamp");
        }

        // Score against the baseline as it stood before this sample.
        let mean = baseline.mean();
        let stddev = baseline.stddev();
        let score = if baseline.is_empty() {
            0.0
        } else {
            z_score(sample.value, mean, stddev)
        };

        baseline.insert(sample.timestamp, sample.value);
        baseline.touch(Instant::now());
        let count = baseline.sample_count();
        self.stats.samples_scored += 1;

        Ok(ScoreResult {
            score,
            confidence: self.confidence(count),
            baseline_mean: mean,
            baseline_stddev: stddev,
        })
    }

    fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.baselines.len();
        self.baselines.retain(|_, b| !b.is_idle(now));
        let evicted = before - self.baselines.len();
        self.stats.baselines_evicted += evicted as u64;
        evicted
    }

    fn stream_count(&self) -> usize {
        self.baselines.len()
    }

    fn stats(&self) -> EngineStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_557_600 + secs, 0).unwrap()
    }

    fn sample(metric: &str, source: &str, value: f64, ts: DateTime<Utc>) -> MetricSample {
        MetricSample::new(metric, value, ts, source).unwrap()
    }

    fn engine() -> ScoringEngine {
        ScoringEngine::new(Duration::hours(1), 10)
    }

    #[test]
    fn test_constant_signal_scores_zero() {
        let mut e = engine();
        for i in 0..50 {
            let r = e.ingest(&sample("cpu", "h", 42.0, t(i * 10))).unwrap();
            assert_eq!(r.score, 0.0);
            assert!(r.score.is_finite());
            assert!(r.confidence.is_finite());
        }
        let snap = e.snapshot(&StreamKey { metric_name: "cpu".into(), source: "h".into() }).unwrap();
        assert_eq!(snap.mean, 42.0);
        assert_eq!(snap.variance, 0.0);
    }

    #[test]
    fn test_deviation_from_flat_baseline_is_maximal() {
        let mut e = engine();
        for i in 0..20 {
            e.ingest(&sample("cpu", "h", 5.0, t(i))).unwrap();
        }
        let r = e.ingest(&sample("cpu", "h", 6.0, t(21))).unwrap();
        assert!(r.score.is_finite());
        assert!(r.score >= 1e8);
        let r = e.ingest(&sample("mem", "h", 1.0, t(0))).unwrap();
        assert_eq!(r.score, 0.0, "first sample of a stream scores zero");
    }

    #[test]
    fn test_confidence_ramps_linearly() {
        let mut e = engine();
        for i in 1..=12u64 {
            let r = e.ingest(&sample("cpu", "h", 50.0, t(i as i64))).unwrap();
            let expected = (i as f64 / 10.0).min(1.0);
            assert!((r.confidence - expected).abs() < 1e-12, "sample {}", i);
        }
    }

    #[test]
    fn test_stale_sample_rejected_without_mutation() {
        let mut e = engine();
        e.ingest(&sample("cpu", "h", 1.0, t(7200))).unwrap();
        e.ingest(&sample("cpu", "h", 2.0, t(7210))).unwrap();
        let key = StreamKey { metric_name: "cpu".into(), source: "h".into() };
        let before = e.snapshot(&key).unwrap();

        let err = e.ingest(&sample("cpu", "h", 100.0, t(0))).unwrap_err();
        assert!(matches!(err, DetectError::StaleSample { .. }));
        assert_eq!(e.snapshot(&key).unwrap(), before);
        assert_eq!(e.stats().stale_rejected, 1);
        assert_eq!(e.stats().samples_scored, 2);
    }

    #[test]
    fn test_duplicate_timestamp_latest_wins() {
        let mut e = engine();
        e.ingest(&sample("cpu", "h", 10.0, t(0))).unwrap();
        e.ingest(&sample("cpu", "h", 20.0, t(1))).unwrap();
        e.ingest(&sample("cpu", "h", 30.0, t(1))).unwrap();
        let key = StreamKey { metric_name: "cpu".into(), source: "h".into() };
        let b = e.baseline(&key).unwrap();
        assert_eq!(b.values(), vec![10.0, 30.0]);
        assert_eq!(b.mean(), 20.0);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut e = engine();
        for i in 0..10 {
            e.ingest(&sample("cpu", "a", 10.0 + (i % 2) as f64, t(i))).unwrap();
        }
        let r = e.ingest(&sample("cpu", "b", 1000.0, t(0))).unwrap();
        assert_eq!(r.score, 0.0);
        assert_eq!(e.stream_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction() {
        let mut e = ScoringEngine::new(Duration::seconds(60), 10);
        e.ingest(&sample("cpu", "a", 1.0, t(0))).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(100)).await;
        e.ingest(&sample("cpu", "b", 1.0, t(0))).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(50)).await;

        assert_eq!(e.evict_idle(Instant::now()), 1);
        assert_eq!(e.stream_count(), 1);
        assert_eq!(e.stats().baselines_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_dated_stream_does_not_evict_neighbours() {
        let mut e = ScoringEngine::new(Duration::seconds(60), 10);
        let now = Utc::now();
        e.ingest(&sample("cpu", "host1", 1.0, now)).unwrap();
        e.ingest(&sample("mem", "host1", 1.0, now + Duration::days(1))).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(6)).await;

        assert_eq!(e.evict_idle(Instant::now()), 0);
        assert_eq!(e.stream_count(), 2);
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut e = engine();
        let mut s = sample("cpu", "h", 1.0, t(0));
        s.value = f64::INFINITY;
        assert!(matches!(e.ingest(&s), Err(DetectError::NonFinite { .. })));
        assert_eq!(e.stream_count(), 0);
    }
}
