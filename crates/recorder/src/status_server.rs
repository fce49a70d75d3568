//! Status HTTP server
//!
//! Exposes the recorder's [`StatusSnapshot`] over `GET /status`.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::orchestrator::Recorder;
use crate::status::StatusSnapshot;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind or serve: {0}")]
    Io(#[from] std::io::Error),
}

async fn get_status(State(recorder): State<Arc<Recorder>>) -> Json<StatusSnapshot> {
    Json(recorder.status().await)
}

/// Router with the `/status` endpoint.
pub fn create_status_router(recorder: Arc<Recorder>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(recorder)
}

/// Serve the status endpoint on `addr` until the task is dropped.
pub async fn run_status_server(recorder: Arc<Recorder>, addr: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| ServerError::InvalidAddress(addr.to_string()))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, create_status_router(recorder)).await?;
    Ok(())
}
