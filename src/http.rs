//! Ambient HTTP surface: `/healthz` and `/metrics`, served by axum on a
//! task independent of the consume loop, sharing only the metrics registry
//! and a read-only view of the broker adapter's connection state.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::ConnectionState;
use crate::context::ProcessorContext;
use crate::error::Result;

#[derive(Clone)]
struct AppState {
    ctx: Arc<ProcessorContext>,
}

/// Binds `addr` and serves until `shutdown` is cancelled.
pub async fn serve(ctx: Arc<ProcessorContext>, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let state = AppState { ctx };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(crate::error::PipelineError::Io)?;
    info!(%addr, "metrics/health HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(crate::error::PipelineError::Io)?;
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let broker_connected = matches!(state.ctx.adapter.state(), ConnectionState::Connected);
    let pool = state.ctx.pool.metrics_snapshot().await;
    let body = serde_json::json!({
        "status": if broker_connected { "healthy" } else { "degraded" },
        "broker_connected": broker_connected,
        "pool_size": pool.size,
        "pool_in_use": pool.in_use,
    });
    let status = if broker_connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, axum::Json(body))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.ctx.metrics.render() {
        Ok(rendered) => (StatusCode::OK, rendered).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
