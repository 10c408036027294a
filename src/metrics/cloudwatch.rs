//! CloudWatch `GetMetricData` response normalization.
//!
//! The API client itself lives outside this crate; whatever fetches the data
//! hands us the JSON body and the source it was queried for.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{retain_finite, MetricSample, Provider};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetMetricDataResponse {
    #[serde(default)]
    pub metric_data_results: Vec<MetricDataResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDataResult {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub status_code: Option<String>,
}

/// Flatten every result series into samples for `source`.
///
/// The metric name is the series label when present, else its query id.
/// Timestamps and values are zipped pairwise; a length mismatch keeps the
/// shorter prefix.
pub fn normalize(resp: &GetMetricDataResponse, source: &str) -> Vec<MetricSample> {
    let mut out = Vec::new();
    for result in &resp.metric_data_results {
        if result.timestamps.len() != result.values.len() {
            tracing::warn!(
                id = %result.id,
                timestamps = result.timestamps.len(),
                values = result.values.len(),
                "CloudWatch series length mismatch"
            );
        }
        let name = result.label.as_deref().unwrap_or(&result.id);
        for (ts, value) in result.timestamps.iter().zip(&result.values) {
            let mut sample = MetricSample {
                metric_name: name.to_string(),
                value: *value,
                timestamp: *ts,
                source: source.to_string(),
                tags: Default::default(),
            };
            sample
                .tags
                .insert("provider".into(), Provider::CloudWatch.to_string());
            sample.tags.insert("cloudwatch_id".into(), result.id.clone());
            if let Some(status) = &result.status_code {
                sample.tags.insert("status_code".into(), status.clone());
            }
            out.push(sample);
        }
    }
    retain_finite(Provider::CloudWatch, &mut out);
    out.sort_by_key(|s| s.timestamp);
    out
}
