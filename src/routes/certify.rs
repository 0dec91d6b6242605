use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use garde::Validate;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    CertifyAllRequest, CertifyAllResponse, CertifyRequest, CertifyResponse, JobStatusResponse,
    QueueStatsResponse,
};
use crate::services::certification::CertifyError;
use crate::services::reconcile::{self, ReconcileError, ReconcileReport};

/// Error envelope returned to API clients. Only the structured category /
/// message surface is exposed, never internals.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<CertifyError> for ApiError {
    fn from(e: CertifyError) -> Self {
        let status = match &e {
            CertifyError::ModelNotFound(_) | CertifyError::JobNotFound(_) => StatusCode::NOT_FOUND,
            CertifyError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            CertifyError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &e {
            // Internal details stay in the logs.
            CertifyError::Db(_) => {
                tracing::error!(error = %e, "database error serving request");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        ApiError { status, message }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        tracing::error!(error = %e, "reconciliation failed");
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "reconciliation failed".to_string(),
        }
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: report.to_string(),
        }
    }
}

/// POST /api/v1/certifications — certify one model deployment in one region.
pub async fn certify_model(
    State(state): State<AppState>,
    Json(req): Json<CertifyRequest>,
) -> Result<(StatusCode, Json<CertifyResponse>), ApiError> {
    req.validate()?;

    let receipt = state
        .certification
        .certify_model(&req.model_id, &req.region, None, req.force)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CertifyResponse {
            job_id: receipt.job_id,
            queue_job_id: receipt.queue_job_id,
            status: if receipt.newly_queued {
                "queued".to_string()
            } else {
                "already_in_flight".to_string()
            },
        }),
    ))
}

/// POST /api/v1/certifications/all — certify every active deployment
/// across the given regions.
pub async fn certify_all_models(
    State(state): State<AppState>,
    Json(req): Json<CertifyAllRequest>,
) -> Result<(StatusCode, Json<CertifyAllResponse>), ApiError> {
    req.validate()?;

    let receipt = state
        .certification
        .certify_all_models(&req.regions, None)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CertifyAllResponse {
            job_id: receipt.job_id,
            total_jobs: receipt.total_jobs,
        }),
    ))
}

/// GET /api/v1/certifications/jobs/{job_id} — job aggregate with its
/// per-(model, region) rows, from the durable store only.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    Ok(Json(state.certification.job_status(job_id).await?))
}

/// GET /api/v1/certifications/stats — live queue counts plus durable
/// aggregates.
pub async fn get_queue_stats(
    State(state): State<AppState>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    Ok(Json(state.certification.queue_stats().await?))
}

/// GET /api/v1/certifications/reconcile — read-only drift report between
/// the queue backend and the durable store.
pub async fn get_reconcile_report(
    State(state): State<AppState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    let report = reconcile::run_reconciliation(&state.db, &state.queue).await?;
    Ok(Json(report))
}

/// GET /api/v1/certifications/{id}/events — SSE progress stream for one
/// in-flight certification. Closing the connection only stops consumption;
/// the worker is untouched.
pub async fn certification_events(
    State(state): State<AppState>,
    Path(certification_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.progress.subscribe(certification_id).await;

    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Event::default().json_data(&event).ok().map(Ok),
            // Lagged receivers skip missed events rather than erroring out.
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
