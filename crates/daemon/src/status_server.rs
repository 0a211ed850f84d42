//! Status HTTP server for the Docling batch orchestrator
//!
//! Serves the daemon status to the CLI and the dashboard, and accepts
//! shutdown requests from `docling-orchestrator stop`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::BatchReport;
use crate::metrics::{SharedStatus, StatusReport};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid status address '{0}'")]
    InvalidAddr(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Clone)]
struct ServerState {
    status: SharedStatus,
    shutdown: CancellationToken,
}

/// Handler for GET /status
async fn get_status(State(state): State<ServerState>) -> Json<StatusReport> {
    let snapshot = state.status.read().await.clone();
    Json(snapshot)
}

/// Handler for GET /batches/:id
async fn get_batch(
    State(state): State<ServerState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchReport>, StatusCode> {
    let status = state.status.read().await;
    status
        .batch(&batch_id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Handler for POST /shutdown
async fn post_shutdown(State(state): State<ServerState>) -> StatusCode {
    info!("Shutdown requested over HTTP");
    state.shutdown.cancel();
    StatusCode::ACCEPTED
}

/// Creates the axum Router with status and control endpoints
pub fn create_status_router(status: SharedStatus, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/batches/:id", get(get_batch))
        .route("/shutdown", post(post_shutdown))
        .with_state(ServerState { status, shutdown })
}

/// Runs the status HTTP server until `shutdown` is cancelled
///
/// # Arguments
/// * `addr` - Listen address, e.g. `127.0.0.1:7878`
/// * `status` - Shared status to serve
/// * `shutdown` - Cancelled by `POST /shutdown`; also stops the server
pub async fn run_status_server(
    addr: &str,
    status: SharedStatus,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| ServerError::InvalidAddr(addr.to_string()))?;
    let app = create_status_router(status, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::report;
    use crate::config::Pipeline;
    use crate::lifecycle::LifecycleState;
    use crate::metrics::new_shared_status;
    use crate::registry::Batch;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;

    async fn seeded_status() -> SharedStatus {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.lifecycle = LifecycleState::Running;
            snapshot.completed_files = 4;
            let mut batch = Batch::new("invoices", PathBuf::from("/in/invoices"), PathBuf::from("/out/invoices"), 5, Pipeline::Standard);
            batch.succeeded = 4;
            batch.fallback_pending = 1;
            snapshot.batches.push(report(&batch, batch.updated_at, 36));
        }
        status
    }

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let app = create_status_router(seeded_status().await, CancellationToken::new());

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusReport =
            serde_json::from_slice(&body).expect("should deserialize to StatusReport");
        assert_eq!(snapshot.lifecycle, LifecycleState::Running);
        assert_eq!(snapshot.completed_files, 4);
        assert_eq!(snapshot.batches.len(), 1);
        assert_eq!(snapshot.batches[0].summary, "in fallback");
    }

    #[tokio::test]
    async fn test_get_batch_found_and_missing() {
        let app = create_status_router(seeded_status().await, CancellationToken::new());

        let found = app
            .clone()
            .oneshot(Request::builder().uri("/batches/invoices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let body = found.into_body().collect().await.unwrap().to_bytes();
        let batch: BatchReport = serde_json::from_slice(&body).unwrap();
        assert_eq!((batch.succeeded, batch.fallback_pending, batch.total), (4, 1, 5));

        let missing = app
            .oneshot(Request::builder().uri("/batches/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_shutdown_cancels_token() {
        let token = CancellationToken::new();
        let app = create_status_router(new_shared_status(), token.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/shutdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_addr_is_rejected() {
        let result = run_status_server("not-an-addr", new_shared_status(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::InvalidAddr(_))));
    }
}
