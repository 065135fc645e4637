//! # Jobs API Handlers
//!
//! Read-only views over the job ledger and the per-job log sink.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::models::{JobStatus, LogLevel, backfill_job, job_log};
use crate::repositories::{ErrorSummary, JobFilter, JobLedger, LogSink};
use crate::server::AppState;

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 100;
const DEFAULT_LOG_LIMIT: u64 = 500;
const MAX_LOG_LIMIT: u64 = 5000;

/// Query parameters for listing jobs
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    /// Filter by merchant shop domain
    pub merchant: Option<String>,
    /// Filter by job status (pending, running, succeeded, failed)
    pub status: Option<String>,
    /// Maximum number of jobs to return (default: 50, max: 100)
    pub limit: Option<u64>,
}

/// Query parameters for reading a job's log
#[derive(Debug, Deserialize, IntoParams)]
pub struct JobLogsQuery {
    /// Only lines at this level (INFO, WARNING, ERROR)
    pub level: Option<String>,
    /// Maximum number of lines (default: 500, max: 5000)
    pub limit: Option<u64>,
}

/// Job record as returned by the API
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: String,
    #[schema(example = "acme.myshopify.com")]
    pub merchant: String,
    #[schema(example = "historical_load")]
    pub job_type: String,
    #[schema(example = "running")]
    pub status: String,
    #[schema(example = "shopify-acme")]
    pub unit_name: Option<String>,
    pub execution_name: Option<String>,
    #[schema(example = "2024-01-15T10:30:00+00:00")]
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub created_by: Option<String>,
}

impl From<backfill_job::Model> for JobInfo {
    fn from(model: backfill_job::Model) -> Self {
        Self {
            id: model.id.to_string(),
            merchant: model.merchant,
            job_type: model.job_type,
            status: model.status,
            unit_name: model.unit_name,
            execution_name: model.execution_name,
            started_at: model.started_at.to_rfc3339(),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            error_message: model.error_message,
            records_processed: model.records_processed,
            duration_seconds: model.duration_seconds,
            created_by: model.created_by,
        }
    }
}

/// Response payload for jobs listing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobInfo>,
}

/// One persisted log line
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogLine {
    pub timestamp: String,
    #[schema(example = "INFO")]
    pub level: String,
    pub message: String,
    #[schema(example = "orders")]
    pub component: Option<String>,
}

impl From<job_log::Model> for LogLine {
    fn from(model: job_log::Model) -> Self {
        Self {
            timestamp: model.timestamp.to_rfc3339(),
            level: model.level,
            message: model.message,
            component: model.component,
        }
    }
}

/// Response payload for a job's log
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobLogsResponse {
    pub job_id: String,
    pub lines: Vec<LogLine>,
}

fn parse_status(raw: Option<String>) -> Result<Option<JobStatus>, ApiError> {
    raw.map(|value| {
        value.parse::<JobStatus>().map_err(|_| {
            validation_error(
                "Invalid query parameters",
                json!({ "status": "must be one of pending, running, succeeded, failed" }),
            )
        })
    })
    .transpose()
}

fn parse_level(raw: Option<String>) -> Result<Option<LogLevel>, ApiError> {
    raw.map(|value| {
        value.parse::<LogLevel>().map_err(|_| {
            validation_error(
                "Invalid query parameters",
                json!({ "level": "must be one of INFO, WARNING, ERROR" }),
            )
        })
    })
    .transpose()
}

/// List backfill jobs, newest first
#[utoipa::path(
    get,
    path = "/jobs",
    security(("bearer_auth" = [])),
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs matching the filters", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let filter = JobFilter {
        merchant: query
            .merchant
            .map(|merchant| merchant.trim().to_ascii_lowercase()),
        status: parse_status(query.status)?,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)),
    };

    let jobs = JobLedger::new(state.db.clone())
        .list(filter)
        .await?
        .into_iter()
        .map(JobInfo::from)
        .collect();
    Ok(Json(JobsResponse { jobs }))
}

/// Get one job record
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job record", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    let job = JobLedger::new(state.db.clone()).get(id).await?;
    Ok(Json(job.into()))
}

/// Read a job's log in write order
#[utoipa::path(
    get,
    path = "/jobs/{id}/logs",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id"), JobLogsQuery),
    responses(
        (status = 200, description = "Log lines", body = JobLogsResponse),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn job_logs(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
    Query(query): Query<JobLogsQuery>,
) -> Result<Json<JobLogsResponse>, ApiError> {
    let level = parse_level(query.level)?;
    JobLedger::new(state.db.clone()).get(id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let lines = LogSink::new(state.db.clone())
        .for_job(id, level, Some(limit))
        .await?
        .into_iter()
        .map(LogLine::from)
        .collect();
    Ok(Json(JobLogsResponse {
        job_id: id.to_string(),
        lines,
    }))
}

/// Error and warning summary for a job
#[utoipa::path(
    get,
    path = "/jobs/{id}/errors",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Error summary", body = ErrorSummary),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn job_errors(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<ErrorSummary>, ApiError> {
    JobLedger::new(state.db.clone()).get(id).await?;
    let summary = LogSink::new(state.db.clone()).error_summary(id).await?;
    Ok(Json(summary))
}
