//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use super::ApiError;
use crate::alerts::DispatchStatus;
use crate::detect::{IncidentStatus, Severity};
use crate::metrics::{azure, cloudwatch, prometheus, MetricSample};
use crate::pipeline::BatchReport;
use crate::storage;

const DEFAULT_LIMIT: usize = 100;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/samples", post(post_samples))
        .route("/ingest/cloudwatch", post(ingest_cloudwatch))
        .route("/ingest/azure", post(ingest_azure))
        .route("/ingest/prometheus", post(ingest_prometheus))
        .route("/anomalies", get(list_anomalies))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/status", post(set_incident_status))
        .route("/alerts/dead-letter", get(dead_letter))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.pipeline.status().await;
    Json(json!({
        "data": status,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "window_size_secs": state.config.engine.window_size_secs,
            "thresholds": state.config.thresholds,
            "channels": state.pipeline.router().channel_names(),
        }
    }))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum SamplesBody {
    One(MetricSample),
    Many(Vec<MetricSample>),
}

fn ingest_response(report: BatchReport) -> Json<Value> {
    let received = report.accepted + report.rejected;
    Json(json!({ "data": report, "meta": { "received": received } }))
}

async fn post_samples(State(state): State<AppState>, Json(body): Json<SamplesBody>) -> Json<Value> {
    let samples = match body {
        SamplesBody::One(s) => vec![s],
        SamplesBody::Many(v) => v,
    };
    ingest_response(state.pipeline.ingest_batch(samples).await)
}

#[derive(Deserialize)]
struct SourceParams {
    source: String,
}

async fn ingest_cloudwatch(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
    Json(body): Json<cloudwatch::GetMetricDataResponse>,
) -> Json<Value> {
    let samples = cloudwatch::normalize(&body, &params.source);
    ingest_response(state.pipeline.ingest_batch(samples).await)
}

async fn ingest_azure(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
    Json(body): Json<azure::MetricsResponse>,
) -> Json<Value> {
    let samples = azure::normalize(&body, &params.source);
    ingest_response(state.pipeline.ingest_batch(samples).await)
}

#[derive(Deserialize)]
struct PromParams {
    /// Metric name for series without `__name__`.
    metric: Option<String>,
}

async fn ingest_prometheus(
    State(state): State<AppState>,
    Query(params): Query<PromParams>,
    Json(body): Json<prometheus::QueryResponse>,
) -> Result<Json<Value>, ApiError> {
    let fallback = params.metric.as_deref().unwrap_or("prometheus");
    let samples = prometheus::normalize(&body, fallback).map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;
    Ok(ingest_response(state.pipeline.ingest_batch(samples).await))
}

// ---------------------------------------------------------------------------
// Anomalies and incidents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnomalyParams {
    source: Option<String>,
    metric: Option<String>,
    severity: Option<Severity>,
    limit: Option<usize>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(params): Query<AnomalyParams>,
) -> Result<Json<Value>, ApiError> {
    let query = storage::anomalies::AnomalyQuery {
        source: params.source,
        metric_name: params.metric,
        min_severity: params.severity,
        limit: params.limit.unwrap_or(DEFAULT_LIMIT),
    };
    let pool = state.pool.clone();
    let anomalies = tokio::task::spawn_blocking(move || storage::anomalies::list(&pool, &query)).await??;
    let total = anomalies.len();
    Ok(Json(json!({ "data": anomalies, "meta": { "total": total } })))
}

#[derive(Deserialize)]
struct IncidentParams {
    status: Option<IncidentStatus>,
    limit: Option<usize>,
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(params): Query<IncidentParams>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    let incidents =
        tokio::task::spawn_blocking(move || storage::incidents::list(&pool, params.status, limit)).await??;
    let total = incidents.len();
    Ok(Json(json!({ "data": incidents, "meta": { "total": total } })))
}

async fn get_incident(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    let correlator = state.pipeline.correlator().clone();
    let pool = state.pool.clone();
    let (incident, anomalies) = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let incident = correlator
            .get(id)?
            .ok_or_else(|| ApiError::not_found(format!("incident {} not found", id)))?;
        let anomalies = storage::anomalies::for_incident(&pool, id)?;
        Ok((incident, anomalies))
    })
    .await??;
    Ok(Json(json!({
        "data": { "incident": incident, "anomalies": anomalies },
        "meta": meta()
    })))
}

#[derive(Deserialize)]
struct StatusBody {
    status: IncidentStatus,
}

async fn set_incident_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    let correlator = state.pipeline.correlator().clone();
    let incident = tokio::task::spawn_blocking(move || correlator.set_status(id, body.status)).await??;
    Ok(Json(json!({ "data": incident, "meta": meta() })))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

async fn dead_letter(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let failed =
        tokio::task::spawn_blocking(move || storage::dispatches::list(&pool, Some(DispatchStatus::Failed), 0)).await??;
    let total = failed.len();
    Ok(Json(json!({ "data": failed, "meta": { "total": total } })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRouter, RouterSettings};
    use crate::api::telemetry::Telemetry;
    use crate::config::Config;
    use crate::detect::incident::IncidentCorrelator;
    use crate::pipeline::{Pipeline, PipelineSettings};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app(dir: &tempfile::TempDir, cancel: &CancellationToken) -> axum::Router {
        let config = Config::default();
        let pool = storage::open_pool(&dir.path().join("api.db")).unwrap();
        let correlator = Arc::new(IncidentCorrelator::new(config.correlation.window(), Some(pool.clone())));
        let router = Arc::new(AlertRouter::new(RouterSettings::default()).with_journal(pool.clone()));
        let pipeline = Pipeline::start(
            PipelineSettings::from(&config),
            correlator,
            router,
            Some(pool.clone()),
            cancel.clone(),
        );
        super::super::router(AppState {
            pipeline,
            pool,
            config: Arc::new(config),
            telemetry: Arc::new(Telemetry::new().unwrap()),
        })
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let resp = app(&dir, &cancel)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["status"], "ok");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_post_samples_then_list_incidents() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let app = app(&dir, &cancel);

        let mut samples: Vec<Value> = (0..20)
            .map(|i| {
                json!({
                    "metric_name": "cpu",
                    "value": if i % 2 == 0 { 49.0 } else { 51.0 },
                    "timestamp": format!("2026-01-01T00:{:02}:00Z", i),
                    "source": "host1"
                })
            })
            .collect();
        samples.push(json!({
            "metric_name": "cpu", "value": 95.0,
            "timestamp": "2026-01-01T00:20:00Z", "source": "host1"
        }));

        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/v1/samples")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&samples).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["accepted"], 21);
        assert_eq!(body["data"]["anomalies"].as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/v1/incidents?status=open").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["meta"]["total"], 1);
        let id = body["data"][0]["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/incidents/{}/status", id))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"resolved"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/api/v1/incidents/{}/status", id))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"open"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_incident_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let resp = app(&dir, &cancel)
            .oneshot(
                Request::get(format!("/api/v1/incidents/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_prometheus_error_payload_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let resp = app(&dir, &cancel)
            .oneshot(
                Request::post("/api/v1/ingest/prometheus")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"error","error":"bad query"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_metrics_exposition_counts_routed_requests() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let app = app(&dir, &cancel);

        for path in ["/api/v1/health", "/api/v1/health", "/nowhere"] {
            app.clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
        }
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let health = text
            .lines()
            .find(|l| l.starts_with("sreagent_http_requests_total{") && l.contains(r#"endpoint="/api/v1/health""#))
            .unwrap();
        assert!(health.ends_with(" 2"));
        assert!(text.contains(r#"endpoint="unmatched""#));
        assert!(text.contains("sreagent_streams 0"));
        assert!(text.contains("sreagent_open_incidents 0"));
        cancel.cancel();
    }
}
