//! # API Handlers
//!
//! HTTP endpoint handlers for the backfill orchestrator API.

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::db;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod backfills;
pub mod jobs;
pub mod tenants;

/// Header naming the operator on whose behalf a mutating request is made
pub const REQUESTED_BY_HEADER: &str = "x-requested-by";

/// Actor recorded when a request does not name one
pub const DEFAULT_ACTOR: &str = "api";

pub(crate) fn requested_by(headers: &axum::http::HeaderMap) -> String {
    headers
        .get(REQUESTED_BY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` or `degraded`
    #[schema(example = "ok")]
    pub status: String,
    /// Execution backend selected at startup
    #[schema(example = "isolated")]
    pub backend: String,
    /// Whether the database answered a ping
    pub database: bool,
}

/// Liveness and database readiness
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match db::health_check(&state.db).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "Health check failed");
            false
        }
    };

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if database { "ok" } else { "degraded" }.to_string(),
            backend: state.orchestrator.backend().kind().to_string(),
            database,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_returns_service_info() {
        let Json(info) = root().await;
        assert_eq!(info.service, "backfill-orchestrator");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn requested_by_falls_back_to_api() {
        let mut headers = axum::http::HeaderMap::new();
        assert_eq!(requested_by(&headers), "api");

        headers.insert(REQUESTED_BY_HEADER, "ops@example.com".parse().unwrap());
        assert_eq!(requested_by(&headers), "ops@example.com");
    }
}
