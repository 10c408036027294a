//! Cron-driven collector polling.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Pipeline;
use crate::config::{CollectorConfig, CollectorSource};
use crate::metrics::prometheus::{PromQuery, PrometheusCollector};
use crate::metrics::replay::ReplayCollector;
use crate::metrics::{Collector, MetricSample, StreamKey};

pub fn build_collector(cfg: &CollectorConfig) -> Result<Arc<dyn Collector>> {
    let timeout = Duration::from_secs(cfg.timeout_secs);
    let collector: Arc<dyn Collector> = match &cfg.source {
        CollectorSource::Prometheus { url, queries } => {
            let queries = queries
                .iter()
                .map(|q| PromQuery {
                    name: q.name.clone(),
                    expr: q.expr.clone(),
                })
                .collect();
            Arc::new(PrometheusCollector::new(&cfg.name, url, queries, timeout)?)
        }
        CollectorSource::Replay { path } => Arc::new(ReplayCollector::new(&cfg.name, path.clone())),
    };
    Ok(collector)
}

/// Drops samples older than the newest one already taken from each stream,
/// so overlapping fetches are not scored twice. A sample at the newest
/// timestamp passes only if its value differs, which lets a backend's late
/// correction of its last point through.
#[derive(Default)]
pub struct Watermarks {
    newest: HashMap<StreamKey, (DateTime<Utc>, f64)>,
}

impl Watermarks {
    pub fn fresh(&mut self, mut samples: Vec<MetricSample>) -> Vec<MetricSample> {
        samples.sort_by_key(|s| s.timestamp);
        samples
            .into_iter()
            .filter(|s| {
                let key = s.key();
                match self.newest.get(&key) {
                    Some((seen, _)) if s.timestamp < *seen => false,
                    Some((seen, value)) if s.timestamp == *seen && s.value == *value => false,
                    _ => {
                        self.newest.insert(key, (s.timestamp, s.value));
                        true
                    }
                }
            })
            .collect()
    }
}

/// Poll `collector` on `schedule` and feed new samples into `pipeline`.
pub async fn run_collector_loop(
    collector: Arc<dyn Collector>,
    schedule: Schedule,
    pipeline: Pipeline,
    cancel: CancellationToken,
) {
    let name = collector.name().to_string();
    info!(collector = %name, provider = %collector.provider(), "Collector started");
    let mut marks = Watermarks::default();

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(collector = %name, "Schedule has no upcoming runs, stopping");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match collector.fetch().await {
            Ok(samples) => {
                let fetched = samples.len();
                let fresh = marks.fresh(samples);
                if fresh.is_empty() {
                    debug!(collector = %name, fetched, "No new samples");
                    continue;
                }
                let report = pipeline.ingest_batch(fresh).await;
                info!(
                    collector = %name,
                    fetched,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    anomalies = report.anomalies.len(),
                    "Collection complete"
                );
            }
            Err(e) => error!(collector = %name, "Fetch failed: {:#}", e),
        }
    }
    info!(collector = %name, "Collector stopped");
}

/// Spawn one loop per configured collector.
pub fn spawn_collectors(
    configs: &[CollectorConfig],
    pipeline: &Pipeline,
    cancel: &CancellationToken,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(configs.len());
    for cfg in configs {
        let schedule = Schedule::from_str(&cfg.schedule)
            .with_context(|| format!("collector '{}': invalid schedule '{}'", cfg.name, cfg.schedule))?;
        let collector = build_collector(cfg)?;
        handles.push(tokio::spawn(run_collector_loop(
            collector,
            schedule,
            pipeline.clone(),
            cancel.clone(),
        )));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600 + secs, 0).unwrap()
    }

    #[test]
    fn test_watermarks_drop_repeats() {
        let mut marks = Watermarks::default();
        let first = vec![
            MetricSample::new("cpu", 1.0, at(10), "a").unwrap(),
            MetricSample::new("cpu", 2.0, at(0), "a").unwrap(),
            MetricSample::new("cpu", 3.0, at(0), "b").unwrap(),
        ];
        assert_eq!(marks.fresh(first).len(), 3);

        let second = vec![
            MetricSample::new("cpu", 1.0, at(10), "a").unwrap(),
            MetricSample::new("cpu", 4.0, at(20), "a").unwrap(),
            MetricSample::new("cpu", 3.0, at(0), "b").unwrap(),
        ];
        let fresh = marks.fresh(second);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].value, 4.0);
    }

    #[test]
    fn test_watermarks_pass_corrected_latest_point() {
        let mut marks = Watermarks::default();
        assert_eq!(marks.fresh(vec![MetricSample::new("cpu", 40.0, at(60), "a").unwrap()]).len(), 1);

        // The backend revised its newest point; older points stay dropped.
        let revised = vec![
            MetricSample::new("cpu", 35.0, at(0), "a").unwrap(),
            MetricSample::new("cpu", 42.5, at(60), "a").unwrap(),
        ];
        let fresh = marks.fresh(revised);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].value, 42.5);

        // Repeating the revision is a plain duplicate.
        assert!(marks.fresh(vec![MetricSample::new("cpu", 42.5, at(60), "a").unwrap()]).is_empty());
    }

    #[test]
    fn test_build_replay_collector() {
        let cfg = CollectorConfig {
            name: "fixture".into(),
            schedule: "0 * * * * *".into(),
            timeout_secs: 5,
            source: CollectorSource::Replay {
                path: PathBuf::from("samples.jsonl"),
            },
        };
        let c = build_collector(&cfg).unwrap();
        assert_eq!(c.name(), "fixture");
        assert_eq!(c.provider(), crate::metrics::Provider::Replay);
    }
}
