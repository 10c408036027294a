//! Anomaly scoring, severity classification and incident grouping.

pub mod baseline;
pub mod classify;
pub mod describe;
pub mod forecast;
pub mod incident;
pub mod scoring;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::{MetricSample, StreamKey};

pub use classify::{classify, Thresholds};
pub use scoring::{ScoreResult, Scorer, ScoringEngine};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectError {
    #[error("stale sample for {key}: {timestamp} is more than {window_secs}s older than newest {newest}")]
    StaleSample {
        key: StreamKey,
        timestamp: DateTime<Utc>,
        newest: DateTime<Utc>,
        window_secs: i64,
    },
    #[error("non-finite value for {key}")]
    NonFinite { key: StreamKey },
    #[error("ingestion pipeline is shut down")]
    Shutdown,
}

/// Severity levels for anomalies and incidents, ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// A single scored deviation that passed classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub metric_name: String,
    pub source: String,
    pub value: f64,
    pub score: f64,
    pub confidence: f64,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
}

impl Anomaly {
    /// Build the anomaly record for a classified sample.
    pub fn from_score(sample: &MetricSample, result: &ScoreResult, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric_name: sample.metric_name.clone(),
            source: sample.source.clone(),
            value: sample.value,
            score: result.score,
            confidence: result.confidence,
            severity,
            detected_at: sample.timestamp,
            description: describe::describe(&sample.metric_name, sample.value, result),
            recommendations: describe::recommendations(&sample.metric_name, severity),
            baseline_mean: result.baseline_mean,
            baseline_stddev: result.baseline_stddev,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "open"),
            IncidentStatus::Investigating => write!(f, "investigating"),
            IncidentStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(IncidentStatus::Open),
            "investigating" => Ok(IncidentStatus::Investigating),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(format!("unknown incident status '{}'", other)),
        }
    }
}

/// A correlated group of anomalies on one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub source: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub anomaly_ids: BTreeSet<Uuid>,
    /// Start of the time bucket the first anomaly fell into.
    pub correlation_key: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::Info.max(Severity::Critical), Severity::Critical);
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for s in [IncidentStatus::Open, IncidentStatus::Investigating, IncidentStatus::Resolved] {
            assert_eq!(s.to_string().parse::<IncidentStatus>().unwrap(), s);
        }
        assert!("closed".parse::<IncidentStatus>().is_err());
        assert!(!IncidentStatus::Resolved.is_open());
        assert!(IncidentStatus::Investigating.is_open());
    }
}
