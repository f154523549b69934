//! Admin HTTP handlers for queue workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Queue inspection (`/queue/snapshot`, `/queue/jobs/{id}`)
//! - Tenant purge (`DELETE /queue/shops/{shop_domain}`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QueueError;
use crate::facade::JobQueue;
use crate::metrics;

/// Shared state for admin endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Queue the worker consumes from.
    pub queue: JobQueue,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        queue: JobQueue,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    pub name: String,
    pub version: String,
    /// Active queue driver.
    pub driver: String,
}

type ErrorResponse = (StatusCode, Json<Value>);

fn error_response(err: QueueError) -> ErrorResponse {
    let status = match &err {
        QueueError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::UnsupportedOperation { .. } => StatusCode::NOT_IMPLEMENTED,
        QueueError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
        driver: state.queue.driver_kind().to_string(),
    })
}

/// Readiness probe handler.
///
/// Pings the queue backend; the in-process driver is always ready.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), ErrorResponse> {
    let driver = state.queue.driver_kind().to_string();

    match state.queue.ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "queue": "ok", "driver": driver }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "queue": format!("error: {}", e), "driver": driver }
            })),
        )),
    }
}

/// Non-terminal jobs, oldest first.
///
/// `GET /queue/snapshot`
pub async fn snapshot_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let jobs = state.queue.snapshot_queue().await.map_err(error_response)?;
    Ok(Json(json!({
        "driver": state.queue.driver_kind(),
        "durable": state.queue.is_durable_backend_enabled(),
        "count": jobs.len(),
        "jobs": jobs,
    })))
}

/// Look up one job.
///
/// `GET /queue/jobs/{id}`
pub async fn job_handler(
    State(state): State<HealthState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ErrorResponse> {
    match state.queue.job(&id).await.map_err(error_response)? {
        Some(job) => Ok(Json(job)),
        None => Err(error_response(QueueError::JobNotFound(id))),
    }
}

/// Drop every outstanding job for a shop.
///
/// `DELETE /queue/shops/{shop_domain}`
pub async fn purge_shop_handler(
    State(state): State<HealthState>,
    Path(shop_domain): Path<String>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let purged = state
        .queue
        .purge_shop_jobs(&shop_domain)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "shop_domain": shop_domain,
        "purged": purged,
    })))
}

/// Prometheus metrics endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the admin router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `GET /queue/snapshot` - Outstanding jobs
/// - `GET /queue/jobs/{id}` - Single job
/// - `DELETE /queue/shops/{shop_domain}` - Purge a tenant
/// - `/metrics` - Prometheus metrics
pub fn admin_router(state: HealthState) -> axum::Router {
    use axum::routing::{delete, get};

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/snapshot", get(snapshot_handler))
        .route("/queue/jobs/{id}", get(job_handler))
        .route("/queue/shops/{shop_domain}", delete(purge_shop_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
