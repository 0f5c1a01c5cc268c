use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::entities::finding;
use crate::server::DispatchRequest;
use crate::web::models::{JobListQuery, JobResponse, OwnerContext};
use crate::web::{AppState, error::AppError};

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", get(list_jobs).post(dispatch_job))
        .route("/active", get(list_active_jobs))
        .route("/{job_id}", get(get_job))
        .route("/{job_id}/findings", get(get_findings).post(report_finding))
        .route("/{job_id}/stop", post(stop_job))
        .route("/{job_id}/export/{format}", get(export_results))
}

#[axum::debug_handler]
async fn list_jobs(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let jobs = app_state.job_tracker.list_jobs(owner.id, query.kind).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

#[axum::debug_handler]
async fn list_active_jobs(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let jobs = app_state.job_tracker.list_active_jobs(owner.id).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

/// Starts the job and answers right away; clients poll the job for progress.
#[axum::debug_handler]
async fn dispatch_job(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    let (job, _handle) = app_state.dispatcher.distribute(owner.id, request).await?;
    Ok((StatusCode::CREATED, Json(JobResponse::from(job))))
}

#[axum::debug_handler]
async fn get_job(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = app_state.job_tracker.get_job(job_id, owner.id).await?;
    Ok(Json(JobResponse::from(job)))
}

#[axum::debug_handler]
async fn get_findings(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Vec<finding::Model>>, AppError> {
    Ok(Json(
        app_state.job_tracker.get_findings(job_id, owner.id).await?,
    ))
}

/// Lets workers report a finding directly, including shortly after the job
/// was stopped or finished.
#[axum::debug_handler]
async fn report_finding(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<finding::Model>), AppError> {
    if !payload.is_object() {
        return Err(AppError::InvalidInput(
            "A finding must be a JSON object.".to_string(),
        ));
    }
    let job = app_state.job_tracker.get_job(job_id, owner.id).await?;
    let finding = app_state.job_tracker.append_finding(job.id, payload).await?;
    Ok((StatusCode::CREATED, Json(finding)))
}

#[axum::debug_handler]
async fn stop_job(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, AppError> {
    let job = app_state.dispatcher.stop_job(owner.id, job_id).await?;
    Ok(Json(JobResponse::from(job)))
}

#[axum::debug_handler]
async fn export_results(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path((job_id, format)): Path<(Uuid, String)>,
) -> Result<Response, AppError> {
    let exported = app_state
        .job_tracker
        .export_results(job_id, owner.id, &format)
        .await?;
    let headers = [
        (header::CONTENT_TYPE, exported.format.content_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", exported.filename),
        ),
    ];
    Ok((headers, exported.body).into_response())
}
