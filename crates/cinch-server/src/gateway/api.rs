//! JSON handlers: webhook intake and the job/worker operations the CLI
//! and web UI call.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use cinch_core::error::CinchError;
use cinch_core::model::{ForgeType, Job, JobId, WorkerId, WorkerStatus};

use crate::ingress::IngressOutcome;

use super::server::{ApiError, AppState};

/// Webhook intake with the forge named in the path.
pub async fn webhook_forge(
    State(state): State<AppState>,
    Path(forge): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let forge = ForgeType::parse(&forge)
        .ok_or_else(|| CinchError::NotFound(format!("unknown forge '{}'", forge)))?;
    deliver(state, Some(forge), headers, body).await
}

/// Webhook intake with adapter selection from headers.
pub async fn webhook_any(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    deliver(state, None, headers, body).await
}

async fn deliver(
    state: AppState,
    forge: Option<ForgeType>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // Dispatch is asynchronous; the 202 only acknowledges intake.
    match state.ingress.handle_webhook(forge, &headers, &body).await? {
        IngressOutcome::Accepted { job_id } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id })),
        )),
        IngressOutcome::Ignored => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "ignored" })),
        )),
    }
}

fn job_json(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id,
        "repo_id": job.repo_id,
        "commit_sha": job.commit_sha,
        "ref_type": job.ref_type.as_str(),
        "ref_name": job.ref_name,
        "pr_number": job.pr_number,
        "base_branch": job.base_branch,
        "author": job.author,
        "trust": job.trust.as_str(),
        "is_fork": job.is_fork,
        "status": job.status.as_str(),
        "assigned_worker_id": job.assigned_worker_id,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "finished_at": job.finished_at,
        "exit_code": job.exit_code,
        "duration_ms": job.duration_ms,
        "error_phase": job.error_phase.map(|p| p.as_str()),
        "attempt": job.attempt,
        "parent_job_id": job.parent_job_id,
    })
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(id)
        .map(JobId::from_uuid)
        .map_err(|_| ApiError(CinchError::Validation(format!("invalid job id '{}'", id))))
}

fn parse_worker_id(id: &str) -> Result<WorkerId, ApiError> {
    Uuid::parse_str(id)
        .map(WorkerId::from_uuid)
        .map_err(|_| ApiError(CinchError::Validation(format!("invalid worker id '{}'", id))))
}

/// GET a job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.store.get_job(parse_job_id(&id)?).await?;
    Ok(Json(job_json(&job)))
}

/// Release a held contributor job for dispatch.
pub async fn approve_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    state.store.approve_job(job_id).await?;
    state.dispatcher.enqueue_job(job_id);
    Ok(Json(json!({ "status": "approved" })))
}

/// Cancel a queued or running job.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    // Surface 404/409 synchronously; the transition itself runs on the
    // scheduler so it cannot race an assignment.
    let job = state.store.get_job(job_id).await?;
    if job.status.is_terminal() {
        return Err(ApiError(CinchError::Conflict(format!(
            "job {} already finished",
            job_id
        ))));
    }
    state.dispatcher.cancel_job(job_id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "cancelling" }))))
}

/// Create a fresh attempt of a terminal job.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.store.retry_job(parse_job_id(&id)?).await?;
    state.dispatcher.enqueue_job(job.id);
    Ok((StatusCode::CREATED, Json(job_json(&job))))
}

/// Stored log chunks for a job (all attempts).
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let _ = state.store.get_job(job_id).await?;
    let chunks = state.logbus.store().read(job_id, None).await?;
    Ok(Json(json!({ "chunks": chunks })))
}

/// Live workers.
pub async fn list_workers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let workers = state.hub.snapshot().await;
    Ok(Json(json!({ "workers": workers })))
}

/// Stop routing new jobs to a worker; close once in-flight work drains.
pub async fn drain_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = parse_worker_id(&id)?;
    if !state.hub.drain(worker_id).await {
        return Err(ApiError(CinchError::NotFound(format!(
            "worker {} is not connected",
            worker_id
        ))));
    }
    let _ = state
        .store
        .set_worker_status(worker_id, WorkerStatus::Draining)
        .await;
    Ok(Json(json!({ "status": "draining" })))
}

/// Close a worker's stream immediately; in-flight jobs are re-queued.
pub async fn disconnect_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = parse_worker_id(&id)?;
    if !state.hub.force_disconnect(worker_id).await {
        return Err(ApiError(CinchError::NotFound(format!(
            "worker {} is not connected",
            worker_id
        ))));
    }
    Ok(Json(json!({ "status": "disconnecting" })))
}
