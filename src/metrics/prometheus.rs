//! Prometheus HTTP API collector.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use super::{retain_finite, Collector, MetricSample, Provider};

#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<QueryData>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    Vector(Vec<InstantSeries>),
    Matrix(Vec<RangeSeries>),
    Scalar(PromPoint),
    #[serde(rename = "string")]
    Text(serde_json::Value),
}

#[derive(Debug, Deserialize)]
pub struct InstantSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    pub value: PromPoint,
}

#[derive(Debug, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<PromPoint>,
}

/// `[unix_seconds, "value"]` as emitted by the HTTP API.
#[derive(Debug, Deserialize)]
pub struct PromPoint(pub f64, pub String);

impl PromPoint {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        let millis = (self.0 * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis).single()
    }

    fn value(&self) -> Option<f64> {
        // Prometheus spells infinities as "+Inf"/"-Inf", which f64 parses.
        self.1.parse::<f64>().ok()
    }
}

/// Normalize a query response.
///
/// `fallback_name` names series that carry no `__name__` label (most
/// expressions with functions applied). The source is the `instance` label,
/// else `job`, else `"prometheus"`.
pub fn normalize(resp: &QueryResponse, fallback_name: &str) -> Result<Vec<MetricSample>> {
    if resp.status != "success" {
        bail!(
            "prometheus query failed: {}",
            resp.error.as_deref().unwrap_or("unknown error")
        );
    }
    let mut out = Vec::new();
    match &resp.data {
        Some(QueryData::Vector(series)) => {
            for s in series {
                push_point(&mut out, &s.metric, &s.value, fallback_name);
            }
        }
        Some(QueryData::Matrix(series)) => {
            for s in series {
                for p in &s.values {
                    push_point(&mut out, &s.metric, p, fallback_name);
                }
            }
        }
        Some(QueryData::Scalar(p)) => {
            push_point(&mut out, &BTreeMap::new(), p, fallback_name);
        }
        Some(QueryData::Text(_)) | None => {}
    }
    retain_finite(Provider::Prometheus, &mut out);
    out.sort_by_key(|s| s.timestamp);
    Ok(out)
}

fn push_point(
    out: &mut Vec<MetricSample>,
    labels: &BTreeMap<String, String>,
    point: &PromPoint,
    fallback_name: &str,
) {
    let (Some(timestamp), Some(value)) = (point.timestamp(), point.value()) else {
        tracing::debug!(?point, "Skipping unparseable prometheus point");
        return;
    };
    let metric_name = labels
        .get("__name__")
        .cloned()
        .unwrap_or_else(|| fallback_name.to_string());
    let source = labels
        .get("instance")
        .or_else(|| labels.get("job"))
        .cloned()
        .unwrap_or_else(|| "prometheus".to_string());
    let mut tags: BTreeMap<String, String> = labels
        .iter()
        .filter(|(k, _)| k.as_str() != "__name__")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    tags.insert("provider".into(), Provider::Prometheus.to_string());
    out.push(MetricSample {
        metric_name,
        value,
        timestamp,
        source,
        tags,
    });
}

/// A named PromQL expression to evaluate on every fetch.
#[derive(Debug, Clone)]
pub struct PromQuery {
    pub name: String,
    pub expr: String,
}

/// Instant-query collector against a Prometheus server.
pub struct PrometheusCollector {
    name: String,
    base_url: String,
    queries: Vec<PromQuery>,
    client: reqwest::Client,
}

impl PrometheusCollector {
    pub fn new(name: &str, base_url: &str, queries: Vec<PromQuery>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            queries,
            client,
        })
    }

    async fn query(&self, q: &PromQuery) -> Result<Vec<MetricSample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp: QueryResponse = self
            .client
            .get(&url)
            .query(&[("query", q.expr.as_str())])
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .json()
            .await
            .context("Invalid prometheus response body")?;
        normalize(&resp, &q.name)
    }
}

#[async_trait::async_trait]
impl Collector for PrometheusCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        Provider::Prometheus
    }

    async fn fetch(&self) -> Result<Vec<MetricSample>> {
        let mut all = Vec::new();
        for q in &self.queries {
            match self.query(q).await {
                Ok(mut samples) => all.append(&mut samples),
                // One broken expression must not starve the others.
                Err(e) => tracing::warn!(collector = %self.name, query = %q.name, "Query failed: {:#}", e),
            }
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_vector() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"__name__": "node_load1", "instance": "host1:9100", "job": "node"},
                     "value": [1714557600.0, "0.75"]},
                    {"metric": {"job": "node"}, "value": [1714557600.0, "NaN"]}
                ]
            }
        }"#;
        let resp: QueryResponse = serde_json::from_str(body).unwrap();
        let samples = normalize(&resp, "load").unwrap();

        assert_eq!(samples.len(), 1, "NaN point should be dropped");
        let s = &samples[0];
        assert_eq!(s.metric_name, "node_load1");
        assert_eq!(s.source, "host1:9100");
        assert_eq!(s.value, 0.75);
        assert_eq!(s.tags.get("job").map(String::as_str), Some("node"));
        assert!(!s.tags.contains_key("__name__"));
    }

    #[test]
    fn test_normalize_matrix_uses_fallback_name() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {"metric": {"job": "api"},
                     "values": [[1714557600, "120"], [1714557660, "135.5"]]}
                ]
            }
        }"#;
        let resp: QueryResponse = serde_json::from_str(body).unwrap();
        let samples = normalize(&resp, "response_time").unwrap();

        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.metric_name == "response_time"));
        assert!(samples.iter().all(|s| s.source == "api"));
        assert_eq!(samples[1].value, 135.5);
    }

    #[test]
    fn test_normalize_error_status() {
        let resp: QueryResponse =
            serde_json::from_str(r#"{"status":"error","error":"bad_data"}"#).unwrap();
        let err = normalize(&resp, "x").unwrap_err();
        assert!(err.to_string().contains("bad_data"));
    }
}
