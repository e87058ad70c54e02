//! Job submission, status and cancellation endpoints.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use neurochron_core::{
    Job, JobFilter, JobId, JobStatus, NewJob, NotificationStatus, PredictionResult, Stage,
};

/// Upper bound on `limit` for listings.
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/{id}", get(get_job))
        .route("/{id}/cancel", post(cancel_job))
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    input_reference: String,
    chronological_age: u32,
    contact: String,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    id: String,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct JobErrorResponse {
    stage: Option<Stage>,
    category: &'static str,
    message: String,
    retry_count: u32,
}

/// Client-facing view of a job. Artifacts are references only.
#[derive(Debug, Serialize)]
struct JobResponse {
    id: String,
    status: JobStatus,
    message: &'static str,
    subject_id: String,
    chronological_age: u32,
    artifacts: BTreeMap<Stage, String>,
    result: Option<PredictionResult>,
    error: Option<JobErrorResponse>,
    notification: Option<NotificationStatus>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let error = job.error.map(|e| JobErrorResponse {
            stage: e.stage,
            category: e.category(),
            message: e.message,
            retry_count: e.retry_count,
        });
        Self {
            id: job.id.to_string(),
            status: job.status,
            message: job.status.progress_message(),
            subject_id: job.subject_id,
            chronological_age: job.chronological_age,
            artifacts: job.stage_artifacts,
            result: job.result,
            error,
            notification: job.notification,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let id = state
        .dispatcher
        .submit(NewJob {
            input_reference: req.input_reference,
            chronological_age: req.chronological_age,
            contact: req.contact,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            id: id.to_string(),
            status: JobStatus::Queued,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.dispatcher.get(JobId::from_uuid(id)).await?;
    Ok(Json(job.into()))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let filter = JobFilter {
        status,
        limit: Some(query.limit.unwrap_or(100).min(MAX_LIST_LIMIT)),
    };
    let jobs: Vec<Job> = state.dispatcher.list(filter).try_collect().await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state.dispatcher.cancel(JobId::from_uuid(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}
