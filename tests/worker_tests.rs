//! Integration tests for the worker entry point.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use backfill_orchestrator::backend::TenantSnapshot;
use backfill_orchestrator::error::OrchestratorError;
use backfill_orchestrator::models::{JobStatus, LogLevel};
use backfill_orchestrator::pipeline::{
    CommandPipeline, ExtractionPipeline, PipelineContext, PipelineError, PipelineReport,
};
use backfill_orchestrator::repositories::{JobLedger, LogSink};
use backfill_orchestrator::worker::{self, PartialPayload, WorkerEnvironment, WorkerOutcome};
use sea_orm::DatabaseConnection;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

const MERCHANT: &str = "acme.myshopify.com";

/// Pipeline double that either reports a record count or fails.
struct ScriptedPipeline {
    result: Result<Option<i64>, String>,
    runs: AtomicUsize,
}

impl ScriptedPipeline {
    fn succeeding(records: i64) -> Self {
        Self {
            result: Ok(Some(records)),
            runs: AtomicUsize::new(0),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            runs: AtomicUsize::new(0),
        }
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionPipeline for ScriptedPipeline {
    async fn run(&self, _ctx: &PipelineContext) -> Result<PipelineReport, PipelineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(records_processed) => Ok(PipelineReport {
                records_processed: *records_processed,
            }),
            Err(message) => Err(PipelineError::Failed(message.clone())),
        }
    }
}

async fn pending_job() -> (DatabaseConnection, WorkerEnvironment) {
    let db = test_utils::setup_test_db().await.unwrap();
    let tenant = test_utils::create_test_tenant(&db, MERCHANT).await.unwrap();
    let job = JobLedger::new(db.clone())
        .create_pending(MERCHANT, None)
        .await
        .unwrap()
        .into_job();

    let env = WorkerEnvironment {
        job_id: job.id,
        merchant: MERCHANT.to_string(),
        tenant: TenantSnapshot::from(&tenant),
        max_retries: 3,
        attempt: 0,
    };
    (db, env)
}

#[tokio::test]
async fn successful_run_moves_job_to_succeeded() {
    let (db, env) = pending_job().await;
    let pipeline = ScriptedPipeline::succeeding(4200);

    let outcome = worker::run(&db, &env, &pipeline).await.unwrap();

    assert_eq!(
        outcome,
        WorkerOutcome::Succeeded {
            records_processed: Some(4200)
        }
    );
    assert_eq!(outcome.exit_code(), 0);

    let job = JobLedger::new(db.clone()).get(env.job_id).await.unwrap();
    assert_eq!(job.status, "succeeded");
    assert_eq!(job.records_processed, Some(4200));
    assert!(job.completed_at.is_some());

    let lines = LogSink::new(db).for_job(env.job_id, None, None).await.unwrap();
    assert!(lines.iter().any(|line| line.message.contains("4200 records processed")));
}

#[tokio::test]
async fn final_attempt_failure_marks_job_failed() {
    let (db, mut env) = pending_job().await;
    env.attempt = 3;
    let pipeline = ScriptedPipeline::failing("API rate limit exhausted");

    let outcome = worker::run(&db, &env, &pipeline).await.unwrap();

    assert!(matches!(outcome, WorkerOutcome::Failed { .. }));
    assert_eq!(outcome.exit_code(), 1);

    let job = JobLedger::new(db.clone()).get(env.job_id).await.unwrap();
    assert_eq!(job.status, "failed");
    assert_eq!(job.error_message.as_deref(), Some("API rate limit exhausted"));

    let summary = LogSink::new(db).error_summary(env.job_id).await.unwrap();
    assert_eq!(summary.error_count, 1);
    assert_eq!(summary.recent[0].level, LogLevel::Error);
}

#[tokio::test]
async fn non_final_failure_leaves_job_running_for_retry() {
    let (db, env) = pending_job().await;
    let pipeline = ScriptedPipeline::failing("connection reset");

    let outcome = worker::run(&db, &env, &pipeline).await.unwrap();

    assert!(matches!(outcome, WorkerOutcome::RetryPending { .. }));
    assert_eq!(outcome.exit_code(), 1);
    let job = JobLedger::new(db).get(env.job_id).await.unwrap();
    assert_eq!(job.status, "running");
    assert!(job.error_message.is_none());
}

#[tokio::test]
async fn retry_resumes_a_running_job() {
    let (db, mut env) = pending_job().await;
    worker::run(&db, &env, &ScriptedPipeline::failing("transient"))
        .await
        .unwrap();

    env.attempt = 1;
    let outcome = worker::run(&db, &env, &ScriptedPipeline::succeeding(7))
        .await
        .unwrap();

    assert!(matches!(outcome, WorkerOutcome::Succeeded { .. }));
    let job = JobLedger::new(db.clone()).get(env.job_id).await.unwrap();
    assert_eq!(job.status, "succeeded");

    let lines = LogSink::new(db).for_job(env.job_id, None, None).await.unwrap();
    assert!(lines.iter().any(|line| line.message.contains("Resuming running job on attempt 2")));
}

#[tokio::test]
async fn terminal_job_is_skipped_without_running_the_pipeline() {
    let (db, env) = pending_job().await;
    JobLedger::new(db.clone())
        .mark_failed(env.job_id, "cancelled by reaper")
        .await
        .unwrap();
    let pipeline = ScriptedPipeline::succeeding(1);

    let outcome = worker::run(&db, &env, &pipeline).await.unwrap();

    assert_eq!(
        outcome,
        WorkerOutcome::Skipped {
            status: JobStatus::Failed
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(pipeline.runs(), 0);
}

#[tokio::test]
async fn unknown_job_is_an_error() {
    let (db, mut env) = pending_job().await;
    env.job_id = Uuid::new_v4();

    let result = worker::run(&db, &env, &ScriptedPipeline::succeeding(1)).await;
    assert!(matches!(result, Err(OrchestratorError::JobNotFound { .. })));
}

#[tokio::test]
async fn merchant_mismatch_is_missing_config() {
    let (db, mut env) = pending_job().await;
    env.merchant = "other.myshopify.com".to_string();

    let result = worker::run(&db, &env, &ScriptedPipeline::succeeding(1)).await;
    assert!(matches!(result, Err(OrchestratorError::MissingConfig { .. })));
}

#[tokio::test]
async fn missing_config_fails_job_only_on_final_attempt() {
    let (db, env) = pending_job().await;
    let err = OrchestratorError::MissingConfig {
        reason: "TENANT_CONFIG is not valid JSON".to_string(),
    };

    worker::record_missing_config(
        &db,
        PartialPayload {
            job_id: env.job_id,
            final_attempt: false,
        },
        &err,
    )
    .await
    .unwrap();
    let ledger = JobLedger::new(db.clone());
    assert_eq!(ledger.get(env.job_id).await.unwrap().status, "pending");

    worker::record_missing_config(
        &db,
        PartialPayload {
            job_id: env.job_id,
            final_attempt: true,
        },
        &err,
    )
    .await
    .unwrap();
    let job = ledger.get(env.job_id).await.unwrap();
    assert_eq!(job.status, "failed");
    assert!(
        job.error_message
            .as_deref()
            .is_some_and(|message| message.contains("TENANT_CONFIG"))
    );

    let summary = LogSink::new(db).error_summary(env.job_id).await.unwrap();
    assert_eq!(summary.error_count, 2);
}

#[tokio::test]
async fn missing_config_for_unknown_job_is_ignored() {
    let db = test_utils::setup_test_db().await.unwrap();
    let err = OrchestratorError::MissingConfig {
        reason: "MERCHANT_IDENTITY is missing".to_string(),
    };

    worker::record_missing_config(
        &db,
        PartialPayload {
            job_id: Uuid::new_v4(),
            final_attempt: true,
        },
        &err,
    )
    .await
    .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn command_pipeline_output_is_captured_into_the_log() {
    let (db, mut env) = pending_job().await;
    env.attempt = env.max_retries;
    let pipeline = CommandPipeline::new(
        "echo \"Fetching orders for $TARGET_STORE\"; \
         echo '[WARNING] throttled on products' >&2; \
         echo 'Records processed: 321'",
    );

    let outcome = worker::run(&db, &env, &pipeline).await.unwrap();
    assert_eq!(
        outcome,
        WorkerOutcome::Succeeded {
            records_processed: Some(321)
        }
    );

    let sink = LogSink::new(db);
    let lines = sink.for_job(env.job_id, None, None).await.unwrap();
    assert!(lines.iter().any(|line| {
        line.message == format!("Fetching orders for {MERCHANT}")
            && line.component.as_deref() == Some("orders")
    }));

    let warnings = sink
        .for_job(env.job_id, Some(LogLevel::Warning), None)
        .await
        .unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].component.as_deref(), Some("products"));
}

#[cfg(unix)]
#[tokio::test]
async fn command_pipeline_exit_code_fails_the_final_attempt() {
    let (db, mut env) = pending_job().await;
    env.attempt = env.max_retries;
    let pipeline = CommandPipeline::new("echo '[ERROR] orders endpoint returned 500'; exit 3");

    let outcome = worker::run(&db, &env, &pipeline).await.unwrap();

    let WorkerOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(error.contains("exited with code 3"));
    assert!(error.contains("orders endpoint returned 500"));
    assert_eq!(
        JobLedger::new(db).get(env.job_id).await.unwrap().status,
        "failed"
    );
}

#[tokio::test]
async fn unconfigured_pipeline_fails_the_final_attempt() {
    let (db, mut env) = pending_job().await;
    env.attempt = env.max_retries;

    let outcome = worker::run(&db, &env, &CommandPipeline::new(""))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        WorkerOutcome::Failed {
            error: "no extraction pipeline command is configured".to_string()
        }
    );
}
