//! Azure Monitor metrics REST response normalization.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{retain_finite, MetricSample, Provider};

#[derive(Debug, Deserialize)]
pub struct MetricsResponse {
    #[serde(default)]
    pub value: Vec<AzureMetric>,
    #[serde(default)]
    pub resourceregion: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AzureMetric {
    pub name: LocalizableString,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub timeseries: Vec<TimeSeriesElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizableString {
    pub value: String,
    #[serde(default)]
    pub localized_value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesElement {
    #[serde(default)]
    pub metadatavalues: Vec<MetadataValue>,
    #[serde(default)]
    pub data: Vec<MetricValue>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataValue {
    pub name: LocalizableString,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    pub time_stamp: DateTime<Utc>,
    pub average: Option<f64>,
    pub total: Option<f64>,
    pub maximum: Option<f64>,
    pub minimum: Option<f64>,
    pub count: Option<f64>,
}

impl MetricValue {
    /// The aggregation we score, in order of preference.
    pub fn pick(&self) -> Option<f64> {
        self.average
            .or(self.total)
            .or(self.maximum)
            .or(self.minimum)
            .or(self.count)
    }
}

/// Flatten all metrics/timeseries into samples for `source`.
///
/// Dimension metadata becomes tags. Points with no aggregation value (Azure
/// emits those for empty intervals) are skipped.
pub fn normalize(resp: &MetricsResponse, source: &str) -> Vec<MetricSample> {
    let mut out = Vec::new();
    for metric in &resp.value {
        for series in &metric.timeseries {
            for point in &series.data {
                let Some(value) = point.pick() else { continue };
                let mut sample = MetricSample {
                    metric_name: metric.name.value.clone(),
                    value,
                    timestamp: point.time_stamp,
                    source: source.to_string(),
                    tags: Default::default(),
                };
                sample
                    .tags
                    .insert("provider".into(), Provider::AzureMonitor.to_string());
                if let Some(unit) = &metric.unit {
                    sample.tags.insert("unit".into(), unit.clone());
                }
                if let Some(region) = &resp.resourceregion {
                    sample.tags.insert("region".into(), region.clone());
                }
                for md in &series.metadatavalues {
                    sample.tags.insert(md.name.value.clone(), md.value.clone());
                }
                out.push(sample);
            }
        }
    }
    retain_finite(Provider::AzureMonitor, &mut out);
    out.sort_by_key(|s| s.timestamp);
    out
}
