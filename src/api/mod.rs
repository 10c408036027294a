//! HTTP surface: sample ingestion, incident operations and status under
//! `/api/v1`, and Prometheus exposition at `/metrics`.

mod error;
mod routes;
pub mod state;
pub mod telemetry;

use axum::http::Uri;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;

pub use error::ApiError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .route("/metrics", get(telemetry::metrics))
        .fallback(unknown_route)
        .layer(middleware::from_fn_with_state(state.clone(), telemetry::track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Unknown paths get the same JSON error body as every other failure.
async fn unknown_route(uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {}", uri.path()))
}
