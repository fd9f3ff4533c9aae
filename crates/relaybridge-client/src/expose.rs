//! Exposition HTTP server: Prometheus text at the metrics path, health
//! JSON, plus `/ready` and `/live` for orchestration probes.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{HealthSection, MetricsConfig};
use crate::error::{ClientError, ClientResult};
use crate::health::{HealthRegistry, HealthStatus};

/// Read handles the exposition layer serves from
#[derive(Clone)]
pub struct ExposeState {
    /// Rendered by `/metrics`
    pub prometheus: PrometheusHandle,
    /// Queried by `/health`
    pub health: HealthRegistry,
    /// Queried by `/ready`
    pub established: watch::Receiver<bool>,
}

/// Build the exposition router
pub fn router(state: ExposeState, metrics: &MetricsConfig, health: &HealthSection) -> Router {
    Router::new()
        .route(&metrics.path, get(metrics_handler))
        .route(&health.path, get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Serve the exposition endpoints until cancelled
pub async fn serve(
    state: ExposeState,
    metrics: &MetricsConfig,
    health: &HealthSection,
    cancel: CancellationToken,
) -> ClientResult<()> {
    let app = router(state, metrics, health);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", metrics.port))
        .await
        .map_err(|e| ClientError::Metrics(format!("bind exposition port {}: {e}", metrics.port)))?;
    info!(port = metrics.port, path = %metrics.path, "exposition endpoints listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ClientError::Metrics(e.to_string()))
}

async fn metrics_handler(State(state): State<ExposeState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
}

async fn health_handler(State(state): State<ExposeState>) -> impl IntoResponse {
    let report = state.health.report();
    let code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

async fn ready_handler(State(state): State<ExposeState>) -> StatusCode {
    if *state.established.borrow() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn live_handler() -> StatusCode {
    StatusCode::OK
}
