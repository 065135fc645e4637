//! HTTP surface tests driven through the router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use backfill_orchestrator::backend::{ExecutionBackend, InMemoryBackend};
use backfill_orchestrator::config::AppConfig;
use backfill_orchestrator::orchestrator::{JobOrchestrator, OrchestratorSettings};
use backfill_orchestrator::server::{AppState, create_app};
use sea_orm::DatabaseConnection;
use serde_json::{Value, json};
use tower::ServiceExt;

#[path = "test_utils/mod.rs"]
mod test_utils;

const TOKEN: &str = "operator-token";
const MERCHANT: &str = "acme.myshopify.com";

struct TestApp {
    router: Router,
    backend: Arc<InMemoryBackend>,
}

impl TestApp {
    async fn new() -> Self {
        let db = test_utils::setup_test_db().await.unwrap();
        Self::with_db(db)
    }

    fn with_db(db: DatabaseConnection) -> Self {
        let backend = Arc::new(InMemoryBackend::isolated(3));
        let config = Arc::new(AppConfig {
            operator_tokens: vec![TOKEN.to_string()],
            ..AppConfig::default()
        });
        let orchestrator = JobOrchestrator::new(
            db.clone(),
            Arc::clone(&backend) as Arc<dyn ExecutionBackend>,
            OrchestratorSettings::default(),
        );
        let router = create_app(AppState {
            config,
            db,
            orchestrator: Arc::new(orchestrator),
        });
        Self { router, backend }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .uri(uri)
                .header("authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn post(&self, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.send_json("POST", uri, body).await
    }

    async fn patch(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send_json("PATCH", uri, Some(body)).await
    }

    async fn send_json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {TOKEN}"))
            .header("x-requested-by", "ops@example.com");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn onboard(&self, merchant: &str) {
        let shop = merchant.split('.').next().unwrap();
        let (status, _) = self
            .post(
                "/tenants",
                Some(json!({
                    "merchant": merchant,
                    "credential_ref": format!("projects/p/secrets/{shop}-token"),
                    "warehouse_project": "analytics",
                    "warehouse_dataset": format!("shopify_{shop}"),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }
}

#[tokio::test]
async fn root_and_health_are_public() {
    let app = TestApp::new().await;

    let (status, body) = app
        .send(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "backfill-orchestrator");

    let (status, body) = app
        .send(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "isolated");
    assert_eq!(body["database"], true);
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let app = TestApp::new().await;

    let (status, body) = app
        .send(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = app
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/tenants/{MERCHANT}/backfills"))
                .header("authorization", "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = TestApp::new().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/")
                .header("x-request-id", "req-abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-abc");
}

#[tokio::test]
async fn tenant_lifecycle_over_http() {
    let app = TestApp::new().await;
    app.onboard(MERCHANT).await;

    let (status, body) = app.get(&format!("/tenants/{MERCHANT}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backfill_start_date"], "2024-01-01");
    assert_eq!(body["created_by"], "ops@example.com");
    assert_eq!(body["is_active"], true);

    let (status, body) = app
        .patch(
            &format!("/tenants/{MERCHANT}"),
            json!({ "warehouse_dataset": "shopify_acme_v2" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["warehouse_dataset"], "shopify_acme_v2");

    let (status, body) = app
        .post(&format!("/tenants/{MERCHANT}/deactivate"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_active"], false);

    let (_, body) = app.get("/tenants?active_only=true").await;
    assert_eq!(body["tenants"].as_array().unwrap().len(), 0);

    let (status, body) = app
        .post(&format!("/tenants/{MERCHANT}/activate"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_active"], true);
}

#[tokio::test]
async fn invalid_and_duplicate_tenants_are_rejected() {
    let app = TestApp::new().await;
    app.onboard(MERCHANT).await;

    let (status, body) = app
        .post(
            "/tenants",
            Some(json!({
                "merchant": "acme.com",
                "credential_ref": "x",
                "warehouse_project": "analytics",
                "warehouse_dataset": "shopify_acme",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let (status, body) = app
        .post(
            "/tenants",
            Some(json!({
                "merchant": MERCHANT,
                "credential_ref": "x",
                "warehouse_project": "analytics",
                "warehouse_dataset": "shopify_acme",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, _) = app.get("/tenants/missing.myshopify.com").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn backfill_request_creates_then_returns_in_flight_job() {
    let app = TestApp::new().await;
    app.onboard(MERCHANT).await;

    let (status, first) = app
        .post(&format!("/tenants/{MERCHANT}/backfills"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["created"], true);
    assert_eq!(first["status"], "pending");
    assert_eq!(first["unit_name"], "shopify-acme");

    let (status, second) = app
        .post(&format!("/tenants/{MERCHANT}/backfills"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["created"], false);
    assert_eq!(second["job_id"], first["job_id"]);
    assert_eq!(app.backend.launches().unwrap().len(), 1);

    let job_id = first["job_id"].as_str().unwrap();
    let (status, job) = app.get(&format!("/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["merchant"], MERCHANT);
    assert_eq!(job["created_by"], "ops@example.com");
    assert_eq!(job["execution_name"], "shopify-acme-exec-1");

    let (status, logs) = app.get(&format!("/jobs/{job_id}/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!logs["lines"].as_array().unwrap().is_empty());

    let (_, history) = app.get(&format!("/tenants/{MERCHANT}/jobs")).await;
    assert_eq!(history["jobs"].as_array().unwrap().len(), 1);

    let (_, listed) = app.get("/jobs?status=pending").await;
    assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_tenant_backfill_is_404_without_a_job() {
    let app = TestApp::new().await;

    let (status, body) = app
        .post("/tenants/ghost.myshopify.com/backfills", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UNKNOWN_TENANT");

    let (_, listed) = app.get("/jobs").await;
    assert!(listed["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn failed_handoff_is_visible_in_error_summary() {
    let app = TestApp::new().await;
    app.onboard(MERCHANT).await;
    app.backend.fail_ensure_with("quota exceeded").unwrap();

    let (status, handle) = app
        .post(&format!("/tenants/{MERCHANT}/backfills"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(handle["status"], "failed");

    let job_id = handle["job_id"].as_str().unwrap();
    let (status, summary) = app.get(&format!("/jobs/{job_id}/errors")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["error_count"], 1);
    assert_eq!(summary["recent"][0]["level"], "ERROR");

    let (_, errors) = app.get(&format!("/jobs/{job_id}/logs?level=ERROR")).await;
    assert_eq!(errors["lines"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn job_queries_validate_input() {
    let app = TestApp::new().await;

    let (status, _) = app.get("/jobs?status=exploded").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .get("/jobs/00000000-0000-0000-0000-000000000000")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn openapi_document_lists_backfill_route() {
    let app = TestApp::new().await;
    let (status, doc) = app
        .send(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/tenants/{merchant}/backfills"]["post"].is_object());
    assert!(doc["components"]["securitySchemes"]["bearer_auth"].is_object());
}
