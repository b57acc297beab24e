//! Control API: stats readout and runtime bitrate changes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::pipeline::PipelineManager;
use crate::stats::StatsSnapshot;

pub async fn start_control_api(
    manager: PipelineManager,
    listen: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/stats", get(stats))
        .route("/bitrate", post(bitrate))
        .with_state(manager);

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("bind control api {}: {}", listen, e))?;
    log::info!("control api listening on {}", listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .map_err(|e| anyhow::anyhow!("control api: {}", e))
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("control api shutting down");
}

async fn stats(State(manager): State<PipelineManager>) -> Json<StatsSnapshot> {
    // Non-advancing read so API polling does not skew the periodic fps.
    Json(manager.stats().peek())
}

#[derive(Debug, Deserialize)]
struct BitrateRequest {
    target_kbps: u32,
    max_kbps: u32,
}

async fn bitrate(
    State(manager): State<PipelineManager>,
    Json(req): Json<BitrateRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    manager
        .set_bitrate(req.target_kbps, req.max_kbps)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{:#}", e)))
}
