//! Canonical telemetry model and provider collectors.
//!
//! Every provider adapter normalizes its native payload into [`MetricSample`]s;
//! nothing downstream of this module knows which provider a sample came from
//! other than the `source` string and tags.

pub mod azure;
pub mod cloudwatch;
pub mod prometheus;
pub mod replay;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

/// One observation of one metric on one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    /// Build a sample, rejecting values that cannot be scored.
    pub fn new(
        metric_name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Result<Self, DetectError> {
        let sample = Self {
            metric_name: metric_name.into(),
            value,
            timestamp,
            source: source.into(),
            tags: BTreeMap::new(),
        };
        sample.check_finite()?;
        Ok(sample)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> StreamKey {
        StreamKey {
            metric_name: self.metric_name.clone(),
            source: self.source.clone(),
        }
    }

    pub(crate) fn check_finite(&self) -> Result<(), DetectError> {
        if self.value.is_finite() {
            Ok(())
        } else {
            Err(DetectError::NonFinite { key: self.key() })
        }
    }
}

/// Identity of a logical metric stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub metric_name: String,
    pub source: String,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.metric_name, self.source)
    }
}

/// Which provider family a collector normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    CloudWatch,
    AzureMonitor,
    Prometheus,
    Replay,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::CloudWatch => write!(f, "cloudwatch"),
            Provider::AzureMonitor => write!(f, "azure_monitor"),
            Provider::Prometheus => write!(f, "prometheus"),
            Provider::Replay => write!(f, "replay"),
        }
    }
}

/// Trait for all metric collectors.
///
/// A collector owns whatever client it needs to talk to its provider and
/// hands back normalized samples. Fetching is the only place it may block.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    /// Stable name used in logs and the collector schedule.
    fn name(&self) -> &str;

    fn provider(&self) -> Provider;

    /// Fetch the latest datapoints, already normalized.
    async fn fetch(&self) -> Result<Vec<MetricSample>>;
}

/// Drop datapoints whose value is not finite, logging how many were lost.
pub(crate) fn retain_finite(provider: Provider, samples: &mut Vec<MetricSample>) {
    let before = samples.len();
    samples.retain(|s| s.value.is_finite());
    let dropped = before - samples.len();
    if dropped > 0 {
        tracing::warn!(%provider, dropped, "Dropped non-finite datapoints");
    }
}
