//! The ingestion pipeline: score, classify, correlate, route.
//!
//! Samples are hashed by stream onto scoring shards. A classified anomaly is
//! persisted and correlated on the calling task, then alerting runs in the
//! background so a slow channel never stalls ingestion.

pub mod collect;
pub(crate) mod worker;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEntity, AlertRouter};
use crate::config::Config;
use crate::detect::incident::{Correlation, CorrelationOutcome, IncidentCorrelator, IncidentError};
use crate::detect::{classify, Anomaly, DetectError, ScoreResult, ScoringEngine, Thresholds};
use crate::metrics::MetricSample;
use crate::storage::{self, Pool};

pub use worker::ShardStats;

const SHARD_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Incident(#[from] IncidentError),
    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// True when the sample itself was unacceptable, as opposed to the
    /// pipeline failing to process it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::Detect(DetectError::StaleSample { .. } | DetectError::NonFinite { .. })
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub window_size: chrono::Duration,
    pub min_samples_for_confidence: u64,
    pub workers: usize,
    pub idle_sweep: Duration,
    pub thresholds: Thresholds,
}

impl From<&Config> for PipelineSettings {
    fn from(c: &Config) -> Self {
        Self {
            window_size: c.engine.window_size(),
            min_samples_for_confidence: c.engine.min_samples_for_confidence,
            workers: c.engine.workers,
            idle_sweep: Duration::from_secs(c.engine.idle_sweep_secs),
            thresholds: c.thresholds,
        }
    }
}

/// What happened to one sample.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub score: ScoreResult,
    pub anomaly: Option<Anomaly>,
    pub correlation: Option<Correlation>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: usize,
    pub anomalies: Vec<Anomaly>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub streams: usize,
    pub samples_scored: u64,
    pub stale_rejected: u64,
    pub baselines_evicted: u64,
    pub anomalies_detected: u64,
    pub incidents_opened: u64,
    pub open_incidents: usize,
    pub alert_queue: HashMap<String, usize>,
    pub dead_letter: usize,
    pub shards: Vec<ShardStats>,
}

#[derive(Default)]
struct Counters {
    anomalies: AtomicU64,
    incidents: AtomicU64,
}

struct Shared {
    shards: Vec<mpsc::Sender<worker::Command>>,
    thresholds: Thresholds,
    correlator: Arc<IncidentCorrelator>,
    router: Arc<AlertRouter>,
    pool: Option<Pool>,
    alerts: TaskTracker,
    workers: TaskTracker,
    counters: Counters,
    started_at: DateTime<Utc>,
}

/// Cheap to clone; every clone feeds the same shards.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Spawn the scoring shards. They stop when `cancel` fires.
    pub fn start(
        settings: PipelineSettings,
        correlator: Arc<IncidentCorrelator>,
        router: Arc<AlertRouter>,
        pool: Option<Pool>,
        cancel: CancellationToken,
    ) -> Self {
        let workers = TaskTracker::new();
        let shard_count = settings.workers.max(1);
        let shards = (0..shard_count)
            .map(|id| {
                let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
                let scorer = Box::new(ScoringEngine::new(
                    settings.window_size,
                    settings.min_samples_for_confidence,
                ));
                workers.spawn(worker::run_shard(id, scorer, rx, settings.idle_sweep, cancel.clone()));
                tx
            })
            .collect();
        workers.close();
        info!(shards = shard_count, window_secs = settings.window_size.num_seconds(), "Scoring pipeline started");

        Self {
            shared: Arc::new(Shared {
                shards,
                thresholds: settings.thresholds,
                correlator,
                router,
                pool,
                alerts: TaskTracker::new(),
                workers,
                counters: Counters::default(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn correlator(&self) -> &Arc<IncidentCorrelator> {
        &self.shared.correlator
    }

    pub fn router(&self) -> &Arc<AlertRouter> {
        &self.shared.router
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.shared.pool.as_ref()
    }

    fn shard_for(&self, sample: &MetricSample) -> &mpsc::Sender<worker::Command> {
        let mut hasher = DefaultHasher::new();
        sample.metric_name.hash(&mut hasher);
        sample.source.hash(&mut hasher);
        let idx = (hasher.finish() % self.shared.shards.len() as u64) as usize;
        &self.shared.shards[idx]
    }

    /// Score one sample, and if it classifies as an anomaly, record and
    /// correlate it and queue the resulting alert.
    pub async fn ingest(&self, sample: MetricSample) -> Result<Ingested, PipelineError> {
        sample.check_finite()?;

        let (reply, rx) = oneshot::channel();
        let shard = self.shard_for(&sample);
        shard
            .send(worker::Command::Ingest {
                sample: sample.clone(),
                reply,
            })
            .await
            .map_err(|_| DetectError::Shutdown)?;
        let score = rx.await.map_err(|_| DetectError::Shutdown)??;

        let Some(severity) = classify(score.score, score.confidence, &self.shared.thresholds) else {
            return Ok(Ingested {
                score,
                anomaly: None,
                correlation: None,
            });
        };

        let anomaly = Anomaly::from_score(&sample, &score, severity);
        self.shared.counters.anomalies.fetch_add(1, Ordering::Relaxed);
        info!(
            anomaly = %anomaly.id,
            stream = %sample.key(),
            value = sample.value,
            score = score.score,
            %severity,
            "Anomaly detected"
        );

        let correlator = Arc::clone(&self.shared.correlator);
        let pool = self.shared.pool.clone();
        let recorded = anomaly.clone();
        let correlation = tokio::task::spawn_blocking(move || {
            if let Some(pool) = &pool {
                if let Err(e) = storage::anomalies::save(pool, &recorded) {
                    error!(anomaly = %recorded.id, "Failed to persist anomaly: {:#}", e);
                }
            }
            correlator.correlate(&recorded)
        })
        .await??;

        let entity = match correlation.outcome {
            CorrelationOutcome::Created => {
                self.shared.counters.incidents.fetch_add(1, Ordering::Relaxed);
                Some(AlertEntity::Incident(correlation.incident.clone()))
            }
            CorrelationOutcome::Escalated => Some(AlertEntity::Anomaly(anomaly.clone())),
            CorrelationOutcome::Merged => None,
        };
        if let Some(entity) = entity {
            let router = Arc::clone(&self.shared.router);
            self.shared.alerts.spawn(async move {
                router.route(&entity).await;
            });
        }

        Ok(Ingested {
            score,
            anomaly: Some(anomaly),
            correlation: Some(correlation),
        })
    }

    /// Ingest samples in order. Rejected samples are counted and skipped.
    pub async fn ingest_batch(&self, samples: Vec<MetricSample>) -> BatchReport {
        let mut report = BatchReport::default();
        for sample in samples {
            let key = sample.key();
            match self.ingest(sample).await {
                Ok(ingested) => {
                    report.accepted += 1;
                    report.anomalies.extend(ingested.anomaly);
                }
                Err(e) if e.is_rejection() => {
                    debug!(stream = %key, "Sample rejected: {}", e);
                    report.rejected += 1;
                    report.errors.push(e.to_string());
                }
                Err(e) => {
                    warn!(stream = %key, "Sample not processed: {}", e);
                    report.rejected += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        report
    }

    /// Wait for alert deliveries started so far to finish.
    pub async fn flush_alerts(&self) {
        let alerts = &self.shared.alerts;
        alerts.close();
        alerts.wait().await;
        alerts.reopen();
    }

    /// Wait for the shards to exit after cancellation.
    pub async fn join(&self) {
        self.shared.workers.wait().await;
    }

    pub async fn status(&self) -> PipelineStatus {
        let mut shards = Vec::with_capacity(self.shared.shards.len());
        for tx in &self.shared.shards {
            let (reply, rx) = oneshot::channel();
            if tx.send(worker::Command::Stats { reply }).await.is_err() {
                continue;
            }
            if let Ok(stats) = rx.await {
                shards.push(stats);
            }
        }

        let now = Utc::now();
        PipelineStatus {
            started_at: self.shared.started_at,
            uptime_secs: (now - self.shared.started_at).num_seconds(),
            streams: shards.iter().map(|s| s.streams).sum(),
            samples_scored: shards.iter().map(|s| s.engine.samples_scored).sum(),
            stale_rejected: shards.iter().map(|s| s.engine.stale_rejected).sum(),
            baselines_evicted: shards.iter().map(|s| s.engine.baselines_evicted).sum(),
            anomalies_detected: self.shared.counters.anomalies.load(Ordering::Relaxed),
            incidents_opened: self.shared.counters.incidents.load(Ordering::Relaxed),
            open_incidents: self.shared.correlator.open_incidents().len(),
            alert_queue: self.shared.router.queue_depths().await,
            dead_letter: self.shared.router.dead_letter().await.len(),
            shards,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RouterSettings;
    use crate::detect::Severity;

    fn pipeline(cancel: &CancellationToken) -> Pipeline {
        let config = Config::default();
        Pipeline::start(
            PipelineSettings::from(&config),
            Arc::new(IncidentCorrelator::new(config.correlation.window(), None)),
            Arc::new(AlertRouter::new(RouterSettings::default())),
            None,
            cancel.clone(),
        )
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_spike_after_steady_signal_is_critical() {
        let cancel = CancellationToken::new();
        let p = pipeline(&cancel);
        for i in 0..20 {
            let v = if i % 2 == 0 { 48.0 } else { 52.0 };
            let out = p.ingest(MetricSample::new("cpu", v, t(i * 60), "host1").unwrap()).await.unwrap();
            assert!(out.anomaly.is_none(), "steady signal at sample {}", i);
        }
        let out = p.ingest(MetricSample::new("cpu", 95.0, t(20 * 60), "host1").unwrap()).await.unwrap();
        let anomaly = out.anomaly.expect("spike is anomalous");
        assert_eq!(anomaly.severity, Severity::Critical);
        assert!(out.score.score >= 5.0);
        assert_eq!(out.correlation.unwrap().outcome, CorrelationOutcome::Created);

        let status = p.status().await;
        assert_eq!(status.samples_scored, 21);
        assert_eq!(status.anomalies_detected, 1);
        assert_eq!(status.open_incidents, 1);
        cancel.cancel();
        p.join().await;
    }

    #[tokio::test]
    async fn test_stale_sample_is_rejected_in_batch() {
        let cancel = CancellationToken::new();
        let p = pipeline(&cancel);
        let samples = vec![
            MetricSample::new("mem", 1.0, t(10_000), "host1").unwrap(),
            MetricSample::new("mem", 1.0, t(0), "host1").unwrap(),
            MetricSample::new("mem", 1.0, t(10_060), "host1").unwrap(),
        ];
        let report = p.ingest_batch(samples).await;
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert!(report.errors[0].contains("stale"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_ingest_after_shutdown_fails() {
        let cancel = CancellationToken::new();
        let p = pipeline(&cancel);
        cancel.cancel();
        p.join().await;
        let err = p
            .ingest(MetricSample::new("cpu", 1.0, t(0), "h").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Detect(DetectError::Shutdown)));
    }
}
