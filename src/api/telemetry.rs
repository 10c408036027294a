//! Prometheus exposition for the agent itself: HTTP request counters and
//! latency, plus pipeline totals refreshed on every scrape.

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use super::state::AppState;
use super::ApiError;
use crate::pipeline::PipelineStatus;

/// Metrics registered against a registry owned by this value, so separate
/// app instances (and tests) never collide.
pub struct Telemetry {
    registry: Registry,
    requests: IntCounterVec,
    latency: Histogram,
    streams: IntGauge,
    samples_scored: IntGauge,
    stale_rejected: IntGauge,
    baselines_evicted: IntGauge,
    anomalies: IntGauge,
    incidents_opened: IntGauge,
    open_incidents: IntGauge,
    dead_letter: IntGauge,
    alert_queue: IntGaugeVec,
}

impl Telemetry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("sreagent_http_requests_total", "HTTP requests served"),
            &["method", "endpoint", "status"],
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new("sreagent_http_request_duration_seconds", "HTTP request latency")
                .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?),
        )?;
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let streams = gauge("sreagent_streams", "Streams with a live baseline")?;
        let samples_scored = gauge("sreagent_samples_scored", "Samples scored since start")?;
        let stale_rejected = gauge("sreagent_stale_rejected", "Samples rejected as older than the window")?;
        let baselines_evicted = gauge("sreagent_baselines_evicted", "Idle baselines evicted since start")?;
        let anomalies = gauge("sreagent_anomalies_detected", "Anomalies detected since start")?;
        let incidents_opened = gauge("sreagent_incidents_opened", "Incidents opened since start")?;
        let open_incidents = gauge("sreagent_open_incidents", "Incidents currently open")?;
        let dead_letter = gauge("sreagent_alert_dead_letter", "Dispatches that failed permanently")?;
        let alert_queue = IntGaugeVec::new(
            Opts::new("sreagent_alert_queue_depth", "Alerts waiting for rate budget"),
            &["channel"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(alert_queue.clone()))?;

        Ok(Self {
            registry,
            requests,
            latency,
            streams,
            samples_scored,
            stale_rejected,
            baselines_evicted,
            anomalies,
            incidents_opened,
            open_incidents,
            dead_letter,
            alert_queue,
        })
    }

    pub fn observe_request(&self, method: &str, endpoint: &str, status: u16, elapsed_secs: f64) {
        let status = status.to_string();
        self.requests
            .with_label_values(&[method, endpoint, status.as_str()])
            .inc();
        self.latency.observe(elapsed_secs);
    }

    pub fn observe_status(&self, status: &PipelineStatus) {
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        self.streams.set(as_i64(status.streams as u64));
        self.samples_scored.set(as_i64(status.samples_scored));
        self.stale_rejected.set(as_i64(status.stale_rejected));
        self.baselines_evicted.set(as_i64(status.baselines_evicted));
        self.anomalies.set(as_i64(status.anomalies_detected));
        self.incidents_opened.set(as_i64(status.incidents_opened));
        self.open_incidents.set(as_i64(status.open_incidents as u64));
        self.dead_letter.set(as_i64(status.dead_letter as u64));
        for (channel, depth) in &status.alert_queue {
            self.alert_queue
                .with_label_values(&[channel.as_str()])
                .set(as_i64(*depth as u64));
        }
    }

    /// Text exposition format.
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}

/// Count and time every request. Unrouted paths share one label so
/// scanners cannot blow up cardinality.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();
    let resp = next.run(req).await;
    state
        .telemetry
        .observe_request(&method, &endpoint, resp.status().as_u16(), started.elapsed().as_secs_f64());
    resp
}

pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let status = state.pipeline.status().await;
    state.telemetry.observe_status(&status);
    let body = state
        .telemetry
        .encode()
        .map_err(|e| anyhow::anyhow!("failed to encode metrics: {}", e))?;
    let content_type = TextEncoder::new().format_type().to_string();
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}
