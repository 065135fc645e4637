//! # Tenants API Handlers
//!
//! Onboarding and administration of per-merchant configuration.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::handlers::jobs::JobInfo;
use crate::handlers::requested_by;
use crate::models::tenant_config;
use crate::repositories::{JobLedger, NewTenantConfig, TenantConfigPatch, TenantConfigRepository};
use crate::server::AppState;

const DEFAULT_HISTORY_LIMIT: u64 = 20;
const MAX_HISTORY_LIMIT: u64 = 100;

/// Tenant configuration as returned by the API
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantInfo {
    #[schema(example = "acme.myshopify.com")]
    pub merchant: String,
    #[schema(example = "projects/acme/secrets/shopify-token")]
    pub credential_ref: String,
    #[schema(example = "analytics-prod")]
    pub warehouse_project: String,
    #[schema(example = "shopify_acme")]
    pub warehouse_dataset: String,
    #[schema(example = "2024-01-01")]
    pub backfill_start_date: NaiveDate,
    pub is_active: bool,
    pub metadata: Option<serde_json::Value>,
    #[schema(example = "2024-01-15T10:30:00+00:00")]
    pub created_at: String,
    pub created_by: Option<String>,
    pub updated_at: String,
    pub updated_by: Option<String>,
}

impl From<tenant_config::Model> for TenantInfo {
    fn from(model: tenant_config::Model) -> Self {
        Self {
            merchant: model.merchant,
            credential_ref: model.credential_ref,
            warehouse_project: model.warehouse_project,
            warehouse_dataset: model.warehouse_dataset,
            backfill_start_date: model.backfill_start_date,
            is_active: model.is_active,
            metadata: model.metadata,
            created_at: model.created_at.to_rfc3339(),
            created_by: model.created_by,
            updated_at: model.updated_at.to_rfc3339(),
            updated_by: model.updated_by,
        }
    }
}

/// Response payload for the tenant listing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantsResponse {
    pub tenants: Vec<TenantInfo>,
}

/// Request payload for onboarding a merchant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateTenantBody {
    /// Shop domain; must end with `.myshopify.com`
    #[schema(example = "acme.myshopify.com")]
    pub merchant: String,
    pub credential_ref: String,
    pub warehouse_project: String,
    pub warehouse_dataset: String,
    /// Defaults to 2024-01-01
    pub backfill_start_date: Option<NaiveDate>,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update; omitted fields are left unchanged
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateTenantBody {
    pub credential_ref: Option<String>,
    pub warehouse_project: Option<String>,
    pub warehouse_dataset: Option<String>,
    pub backfill_start_date: Option<NaiveDate>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListTenantsQuery {
    /// Only return active tenants (default: false)
    pub active_only: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Maximum number of jobs to return (default 20, max 100)
    pub limit: Option<u64>,
}

/// Response payload for a merchant's job history
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantJobsResponse {
    pub merchant: String,
    pub jobs: Vec<JobInfo>,
}

fn repository(state: &AppState) -> TenantConfigRepository {
    TenantConfigRepository::new(state.db.clone())
}

fn tenant_not_found(merchant: &str) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        &format!("Tenant '{merchant}' not found"),
    )
}

/// List tenant configurations
#[utoipa::path(
    get,
    path = "/tenants",
    security(("bearer_auth" = [])),
    params(ListTenantsQuery),
    responses(
        (status = 200, description = "Tenant configurations ordered by merchant", body = TenantsResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn list_tenants(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(query): Query<ListTenantsQuery>,
) -> Result<Json<TenantsResponse>, ApiError> {
    let tenants = repository(&state)
        .list(query.active_only.unwrap_or(false))
        .await?
        .into_iter()
        .map(TenantInfo::from)
        .collect();
    Ok(Json(TenantsResponse { tenants }))
}

/// Onboard a merchant
#[utoipa::path(
    post,
    path = "/tenants",
    security(("bearer_auth" = [])),
    request_body = CreateTenantBody,
    responses(
        (status = 201, description = "Tenant created", body = TenantInfo),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "Tenant already exists", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    headers: HeaderMap,
    Json(body): Json<CreateTenantBody>,
) -> Result<(StatusCode, Json<TenantInfo>), ApiError> {
    let actor = requested_by(&headers);
    let created = repository(&state)
        .create(
            NewTenantConfig {
                merchant: body.merchant,
                credential_ref: body.credential_ref,
                warehouse_project: body.warehouse_project,
                warehouse_dataset: body.warehouse_dataset,
                backfill_start_date: body.backfill_start_date,
                metadata: body.metadata,
            },
            Some(&actor),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// Get a tenant configuration
#[utoipa::path(
    get,
    path = "/tenants/{merchant}",
    security(("bearer_auth" = [])),
    params(("merchant" = String, Path, description = "Shop domain")),
    responses(
        (status = 200, description = "Tenant configuration", body = TenantInfo),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn get_tenant(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(merchant): Path<String>,
) -> Result<Json<TenantInfo>, ApiError> {
    repository(&state)
        .get(&merchant)
        .await?
        .map(|tenant| Json(tenant.into()))
        .ok_or_else(|| tenant_not_found(&merchant))
}

/// Update a tenant configuration
#[utoipa::path(
    patch,
    path = "/tenants/{merchant}",
    security(("bearer_auth" = [])),
    params(("merchant" = String, Path, description = "Shop domain")),
    request_body = UpdateTenantBody,
    responses(
        (status = 200, description = "Updated configuration", body = TenantInfo),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn update_tenant(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    headers: HeaderMap,
    Path(merchant): Path<String>,
    Json(body): Json<UpdateTenantBody>,
) -> Result<Json<TenantInfo>, ApiError> {
    let actor = requested_by(&headers);
    let patch = TenantConfigPatch {
        credential_ref: body.credential_ref,
        warehouse_project: body.warehouse_project,
        warehouse_dataset: body.warehouse_dataset,
        backfill_start_date: body.backfill_start_date,
        metadata: body.metadata,
    };
    let updated = repository(&state)
        .update(&merchant, patch, Some(&actor))
        .await?;
    Ok(Json(updated.into()))
}

/// Soft-deactivate a tenant
#[utoipa::path(
    post,
    path = "/tenants/{merchant}/deactivate",
    security(("bearer_auth" = [])),
    params(("merchant" = String, Path, description = "Shop domain")),
    responses(
        (status = 200, description = "Tenant deactivated", body = TenantInfo),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn deactivate_tenant(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    headers: HeaderMap,
    Path(merchant): Path<String>,
) -> Result<Json<TenantInfo>, ApiError> {
    let actor = requested_by(&headers);
    let tenant = repository(&state)
        .deactivate(&merchant, Some(&actor))
        .await?;
    Ok(Json(tenant.into()))
}

/// Re-activate a tenant
#[utoipa::path(
    post,
    path = "/tenants/{merchant}/activate",
    security(("bearer_auth" = [])),
    params(("merchant" = String, Path, description = "Shop domain")),
    responses(
        (status = 200, description = "Tenant activated", body = TenantInfo),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn activate_tenant(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    headers: HeaderMap,
    Path(merchant): Path<String>,
) -> Result<Json<TenantInfo>, ApiError> {
    let actor = requested_by(&headers);
    let tenant = repository(&state)
        .activate(&merchant, Some(&actor))
        .await?;
    Ok(Json(tenant.into()))
}

/// Backfill history for one merchant, newest first
#[utoipa::path(
    get,
    path = "/tenants/{merchant}/jobs",
    security(("bearer_auth" = [])),
    params(("merchant" = String, Path, description = "Shop domain"), HistoryQuery),
    responses(
        (status = 200, description = "Job history", body = TenantJobsResponse),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn tenant_jobs(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(merchant): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<TenantJobsResponse>, ApiError> {
    let tenant = repository(&state)
        .get(&merchant)
        .await?
        .ok_or_else(|| tenant_not_found(&merchant))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let jobs = JobLedger::new(state.db.clone())
        .history(&tenant.merchant, limit)
        .await?
        .into_iter()
        .map(JobInfo::from)
        .collect();
    Ok(Json(TenantJobsResponse {
        merchant: tenant.merchant,
        jobs,
    }))
}
