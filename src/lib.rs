//! sreagent -- streaming metric anomaly scoring, incident correlation and
//! alert routing.
//!
//! Samples arrive from collectors or the HTTP API, are scored against a
//! rolling per-stream baseline, classified into severities, grouped into
//! incidents per source and routed to notification channels.

pub mod alerts;
pub mod api;
pub mod config;
pub mod detect;
pub mod metrics;
pub mod pipeline;
pub mod storage;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertDispatch, AlertRouter, RouterSettings};
use crate::config::Config;
use crate::detect::incident::IncidentCorrelator;
use crate::detect::Incident;
use crate::pipeline::{BatchReport, Pipeline, PipelineSettings};
use crate::storage::Pool;

/// Build the alert router with every configured channel.
pub fn build_alert_router(config: &Config, pool: Option<Pool>) -> Result<AlertRouter> {
    let timeout = Duration::from_secs(config.alerts.send_timeout_secs);
    let mut router = AlertRouter::new(RouterSettings::from(&config.alerts));
    for ch in &config.channels {
        let channel = alerts::webhook::build_channel(ch, timeout)
            .with_context(|| format!("Failed to build channel '{}'", ch.name))?;
        tracing::info!(channel = %ch.name, kind = %ch.kind, min_severity = %ch.min_severity, "Alert channel configured");
        router.add_channel(channel, ch.min_severity);
    }
    if let Some(pool) = pool {
        router = router.with_journal(pool);
    }
    Ok(router)
}

/// Restore persisted state and start the scoring pipeline.
pub async fn start_pipeline(config: &Config, pool: Option<Pool>, cancel: CancellationToken) -> Result<Pipeline> {
    let router = Arc::new(build_alert_router(config, pool.clone())?);
    router.restore().await.context("Failed to restore alert journal")?;

    let correlator = Arc::new(IncidentCorrelator::new(config.correlation.window(), pool.clone()));
    let restore_from = Arc::clone(&correlator);
    tokio::task::spawn_blocking(move || restore_from.restore())
        .await?
        .context("Failed to restore open incidents")?;

    Ok(Pipeline::start(
        PipelineSettings::from(config),
        correlator,
        router,
        pool,
        cancel,
    ))
}

/// Start the sreagent daemon: API server, scoring pipeline, collectors and
/// the alert drain loop.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.server.db_path.clone();
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(&db_path)?;

    // 2. Start the pipeline
    let cancel = CancellationToken::new();
    let pipeline = start_pipeline(&config, Some(pool.clone()), cancel.clone()).await?;

    // 3. Background loops
    let drain = tokio::spawn(alerts::router::run_drain_loop(
        Arc::clone(pipeline.router()),
        cancel.clone(),
    ));
    let collectors = pipeline::collect::spawn_collectors(&config.collectors, &pipeline, &cancel)?;

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState {
        pipeline: pipeline.clone(),
        pool,
        config: Arc::new(config),
        telemetry: Arc::new(api::telemetry::Telemetry::new().context("Failed to register metrics")?),
    });

    tracing::info!(%addr, "sreagent listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    pipeline.join().await;
    for handle in collectors {
        let _ = handle.await;
    }
    let _ = drain.await;
    tracing::info!("sreagent stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    #[serde(flatten)]
    pub batch: BatchReport,
    pub incidents: Vec<Incident>,
    pub dead_letter: Vec<AlertDispatch>,
}

/// Feed a JSON-lines sample file through the full pipeline.
///
/// With `deliver` false no channels are configured, so nothing leaves the
/// process. `pool` persists results when given.
pub async fn replay(config: &Config, path: &Path, deliver: bool, pool: Option<Pool>) -> Result<ReplayReport> {
    let samples = metrics::replay::read_file(path)?;
    tracing::info!(path = %path.display(), samples = samples.len(), "Replaying samples");

    let mut config = config.clone();
    if !deliver {
        config.channels.clear();
    }
    let cancel = CancellationToken::new();
    let pipeline = start_pipeline(&config, pool, cancel.clone()).await?;
    let batch = pipeline.ingest_batch(samples).await;
    pipeline.flush_alerts().await;

    let report = ReplayReport {
        batch,
        incidents: pipeline.correlator().open_incidents(),
        dead_letter: pipeline.router().dead_letter().await,
    };
    cancel.cancel();
    pipeline.join().await;
    Ok(report)
}
