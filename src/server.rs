//! # Server Configuration
//!
//! Router, shared state and OpenAPI document for the backfill orchestrator API.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio::signal;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::handlers;
use crate::orchestrator::JobOrchestrator;
use crate::telemetry::{self, TraceContext};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub orchestrator: Arc<JobOrchestrator>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/tenants",
            get(handlers::tenants::list_tenants).post(handlers::tenants::create_tenant),
        )
        .route(
            "/tenants/{merchant}",
            get(handlers::tenants::get_tenant).patch(handlers::tenants::update_tenant),
        )
        .route(
            "/tenants/{merchant}/deactivate",
            post(handlers::tenants::deactivate_tenant),
        )
        .route(
            "/tenants/{merchant}/activate",
            post(handlers::tenants::activate_tenant),
        )
        .route(
            "/tenants/{merchant}/jobs",
            get(handlers::tenants::tenant_jobs),
        )
        .route(
            "/tenants/{merchant}/backfills",
            post(handlers::backfills::request_backfill),
        )
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/logs", get(handlers::jobs::job_logs))
        .route("/jobs/{id}/errors", get(handlers::jobs::job_errors))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Scopes each request to a trace id taken from `x-request-id` or generated,
/// and echoes it back on the response.
async fn trace_middleware(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()));

    let mut request = request;
    let context = TraceContext {
        trace_id: trace_id.clone(),
    };
    request.extensions_mut().insert(context.clone());

    let mut response = telemetry::with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Starts the server and serves until SIGINT/SIGTERM
pub async fn run_server(config: Arc<AppConfig>, state: AppState) -> anyhow::Result<()> {
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::tenants::list_tenants,
        crate::handlers::tenants::create_tenant,
        crate::handlers::tenants::get_tenant,
        crate::handlers::tenants::update_tenant,
        crate::handlers::tenants::deactivate_tenant,
        crate::handlers::tenants::activate_tenant,
        crate::handlers::tenants::tenant_jobs,
        crate::handlers::backfills::request_backfill,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::job_logs,
        crate::handlers::jobs::job_errors,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::JobStatus,
            crate::models::LogLevel,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::tenants::TenantInfo,
            crate::handlers::tenants::TenantsResponse,
            crate::handlers::tenants::CreateTenantBody,
            crate::handlers::tenants::UpdateTenantBody,
            crate::handlers::tenants::TenantJobsResponse,
            crate::handlers::jobs::JobInfo,
            crate::handlers::jobs::JobsResponse,
            crate::handlers::jobs::LogLine,
            crate::handlers::jobs::JobLogsResponse,
            crate::orchestrator::JobHandle,
            crate::repositories::ErrorSummary,
            crate::repositories::SummaryLine,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "tenants", description = "Merchant configuration"),
        (name = "backfills", description = "Backfill orchestration"),
        (name = "jobs", description = "Job ledger and logs"),
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Backfill Orchestrator API",
        description = "Per-merchant historical backfill orchestration",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}
