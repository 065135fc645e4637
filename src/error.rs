//! # Error Handling
//!
//! Domain errors raised by the orchestrator and worker, and the problem+json
//! [`ApiError`] the HTTP surface renders them as.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::JobStatus;
use crate::telemetry;

/// Failure taxonomy for orchestration, ledger writes and worker runs.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Merchant is not configured or has been deactivated. No job record exists.
    #[error("merchant '{merchant}' is not an active tenant")]
    UnknownTenant { merchant: String },
    #[error("failed to create execution unit '{unit_name}': {message}")]
    UnitCreationFailed { unit_name: String, message: String },
    #[error("failed to launch execution unit '{unit_name}': {message}")]
    LaunchFailed { unit_name: String, message: String },
    #[error("launch payload is missing or malformed: {reason}")]
    MissingConfig { reason: String },
    #[error("extraction pipeline failed: {message}")]
    Pipeline { message: String },
    /// Another writer kept winning the in-flight slot for this merchant.
    #[error("could not claim or read the in-flight job for '{merchant}'")]
    LedgerWriteConflict { merchant: String },
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {job_id} not found")]
    JobNotFound { job_id: Uuid },
    #[error("tenant '{merchant}' already exists")]
    TenantExists { merchant: String },
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
}

impl OrchestratorError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Short machine-readable label, used for metrics and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTenant { .. } => "unknown_tenant",
            Self::UnitCreationFailed { .. } => "unit_creation_failed",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::MissingConfig { .. } => "missing_config",
            Self::Pipeline { .. } => "pipeline",
            Self::LedgerWriteConflict { .. } => "ledger_write_conflict",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::JobNotFound { .. } => "job_not_found",
            Self::TenantExists { .. } => "tenant_exists",
            Self::Validation { .. } => "validation",
            Self::Database(_) => "database",
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

/// Returns true when `error` is a unique-constraint violation on Postgres or SQLite.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code_str = code.as_ref();
        code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str)
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::UnknownTenant { merchant } => Self::new(
                StatusCode::NOT_FOUND,
                "UNKNOWN_TENANT",
                &format!("Merchant '{merchant}' is not an active tenant"),
            ),
            OrchestratorError::JobNotFound { job_id } => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Job {job_id} not found"),
            ),
            OrchestratorError::Validation { field, message } => {
                let mut details = serde_json::Map::new();
                details.insert(field.to_string(), json!(message));
                validation_error("Validation failed", serde_json::Value::Object(details))
            }
            OrchestratorError::TenantExists { merchant } => Self::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                &format!("Tenant '{merchant}' already exists"),
            ),
            OrchestratorError::InvalidTransition { job_id, from, to } => Self::new(
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                &format!("Job {job_id} cannot move from {from} to {to}"),
            ),
            OrchestratorError::LedgerWriteConflict { merchant } => Self::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                &format!("A backfill for '{merchant}' is being created concurrently; retry"),
            ),
            OrchestratorError::UnitCreationFailed { .. } | OrchestratorError::LaunchFailed { .. } => {
                tracing::error!(error = %error, "Execution backend error");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "BACKEND_ERROR",
                    &error.to_string(),
                )
            }
            OrchestratorError::Database(db_err) => db_err.into(),
            OrchestratorError::MissingConfig { .. } | OrchestratorError::Pipeline { .. } => {
                tracing::error!(error = %error, "Worker-level error reached the API");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tenant_maps_to_404() {
        let error: ApiError = OrchestratorError::UnknownTenant {
            merchant: "ghost.myshopify.com".into(),
        }
        .into();

        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, Box::from("UNKNOWN_TENANT"));
        assert!(error.message.contains("ghost.myshopify.com"));
    }

    #[test]
    fn validation_carries_field_details() {
        let error: ApiError =
            OrchestratorError::validation("merchant", "must end with .myshopify.com").into();

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            error.details,
            Some(Box::new(json!({"merchant": "must end with .myshopify.com"})))
        );
    }

    #[test]
    fn invalid_transition_is_a_conflict() {
        let error: ApiError = OrchestratorError::InvalidTransition {
            job_id: Uuid::nil(),
            from: JobStatus::Succeeded,
            to: JobStatus::Running,
        }
        .into();

        assert_eq!(error.status, StatusCode::CONFLICT);
        assert_eq!(error.code, Box::from("INVALID_TRANSITION"));
        assert!(error.message.contains("succeeded"));
    }

    #[test]
    fn record_not_found_maps_to_404() {
        let error: ApiError = sea_orm::DbErr::RecordNotFound("job".into()).into();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn non_sqlx_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sea_orm::DbErr::Custom("dup".into())));
        assert!(!is_unique_violation(&sea_orm::DbErr::RecordNotInserted));
    }

    #[test]
    fn problem_json_content_type_is_set() {
        let response = unauthorized(None).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn trace_id_falls_back_to_correlation_id() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "bad");
        let trace_id = error.trace_id.expect("trace id");
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }
}
