//! HTTP surface: job submission, status, cancellation, cluster state,
//! and the Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::engine::EngineHandle;
use crate::error::{Result, ScanError};
use crate::metrics::EngineMetrics;
use crate::scheduler::job::{FailurePolicy, Priority, ScanRequest, SourceRef};

#[derive(Clone)]
pub struct AppState {
    pub handle: EngineHandle,
    pub metrics: Arc<EngineMetrics>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitScanBody {
    pub source: String,
    pub source_bytes: Option<u64>,
    /// Opaque rule-set reference, forwarded to the connector unexamined.
    pub rule_set_ref: Option<serde_json::Value>,
    pub priority: Option<Priority>,
    pub deadline_secs: Option<i64>,
    pub failure_policy: Option<FailurePolicy>,
    pub max_concurrency: Option<u32>,
    pub merge_results: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitScanResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError(ScanError);

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ScanError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ScanError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ScanError::NotLeader(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/scans", get(list_handler).post(submit_handler))
        .route(
            "/scans/:job_id",
            get(status_handler).delete(cancel_handler),
        )
        .route("/cluster", get(cluster_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the shutdown token fires.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ScanError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "Scan API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ScanError::Internal(e.to_string()))
}

impl SubmitScanBody {
    fn into_request(self) -> ScanRequest {
        let source = match self.source_bytes {
            Some(bytes) => SourceRef::sized(self.source, bytes),
            None => SourceRef::new(self.source),
        };
        let mut request = ScanRequest::new(source);
        if let Some(rules) = self.rule_set_ref {
            request = request.with_rule_set(rules);
        }
        if let Some(priority) = self.priority {
            request = request.with_priority(priority);
        }
        if let Some(secs) = self.deadline_secs {
            request = request.with_deadline(Utc::now() + ChronoDuration::seconds(secs));
        }
        if let Some(policy) = self.failure_policy {
            request = request.with_failure_policy(policy);
        }
        if let Some(max) = self.max_concurrency {
            request = request.with_max_concurrency(max);
        }
        if self.merge_results.unwrap_or(false) {
            request = request.with_merge_results();
        }
        request
    }
}

async fn submit_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitScanBody>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let job_id = state.handle.submit(body.into_request()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitScanResponse { job_id }),
    ))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let status = state.handle.status(job_id).await?;
    Ok(Json(status))
}

async fn cancel_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state.handle.cancel(job_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_handler(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let jobs = state.handle.list().await?;
    Ok(Json(jobs))
}

async fn cluster_handler(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let status = state.handle.cluster_status().await?;
    Ok(Json(status))
}

async fn metrics_handler(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let body = state.metrics.render()?;
    Ok(([("content-type", "text/plain; version=0.0.4")], body))
}
