//! # Backfill Request Handler
//!
//! The orchestration runs on its own task, so a client that disconnects
//! mid-request cannot cancel a handoff halfway through.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};

use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::handlers::requested_by;
use crate::orchestrator::JobHandle;
use crate::server::AppState;
use crate::telemetry::{self, TraceContext};

/// Request the historical backfill for a merchant
///
/// Returns 202 with a new job, or 200 with the job already in flight.
#[utoipa::path(
    post,
    path = "/tenants/{merchant}/backfills",
    security(("bearer_auth" = [])),
    params(("merchant" = String, Path, description = "Shop domain")),
    responses(
        (status = 202, description = "Backfill job created", body = JobHandle),
        (status = 200, description = "Backfill already in flight", body = JobHandle),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Unknown or inactive tenant", body = ApiError)
    ),
    tag = "backfills"
)]
pub async fn request_backfill(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    headers: HeaderMap,
    Path(merchant): Path<String>,
) -> Result<(StatusCode, Json<JobHandle>), ApiError> {
    let actor = requested_by(&headers);
    let orchestrator = Arc::clone(&state.orchestrator);
    let trace = telemetry::current_trace_id().map(|trace_id| TraceContext { trace_id });

    let task = tokio::spawn(async move {
        let run = orchestrator.request_backfill(&merchant, Some(&actor));
        match trace {
            Some(context) => telemetry::with_trace_context(context, run).await,
            None => run.await,
        }
    });

    let handle = task.await.map_err(|err| {
        tracing::error!(error = %err, "Backfill orchestration task failed");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    })??;

    let status = if handle.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(handle)))
}
