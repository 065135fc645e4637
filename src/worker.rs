//! Worker entry point.
//!
//! Runs inside an execution unit. Reads the launch payload from its own
//! environment, moves the job to `running`, runs the extraction pipeline and
//! records the outcome. The process exit code is what the backend's retry
//! policy acts on.
//!
//! On the isolated runner a failing attempt that still has retries left keeps
//! the job `running` and exits non-zero; only the final attempt writes
//! `failed`.

use metrics::counter;
use sea_orm::DatabaseConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::{
    KEY_JOB_ID, KEY_MAX_RETRIES, KEY_MERCHANT_IDENTITY, KEY_TENANT_CONFIG, TenantSnapshot, env_key,
};
use crate::error::OrchestratorError;
use crate::models::JobStatus;
use crate::pipeline::{ExtractionPipeline, PipelineContext};
use crate::repositories::{JobLedger, LogSink};

/// Zero-based attempt index exported by Cloud Run to each task.
pub const ATTEMPT_ENV: &str = "CLOUD_RUN_TASK_ATTEMPT";

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_MISSING_CONFIG: i32 = 2;

const COMPONENT: &str = "worker";

/// Launch payload as decoded from the worker's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnvironment {
    pub job_id: Uuid,
    pub merchant: String,
    pub tenant: TenantSnapshot,
    pub max_retries: u32,
    pub attempt: u32,
}

fn missing(reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::MissingConfig {
        reason: reason.into(),
    }
}

impl WorkerEnvironment {
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self, OrchestratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            let name = env_key(key);
            lookup(&name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| missing(format!("{name} is not set")))
        };

        let job_id = parse_job_id(&read(KEY_JOB_ID)?)?;
        let merchant = read(KEY_MERCHANT_IDENTITY)?;
        let tenant: TenantSnapshot = serde_json::from_str(&read(KEY_TENANT_CONFIG)?)
            .map_err(|err| missing(format!("{} is malformed: {err}", env_key(KEY_TENANT_CONFIG))))?;
        if tenant.merchant != merchant {
            return Err(missing(format!(
                "tenant snapshot is for '{}' but merchant identity is '{merchant}'",
                tenant.merchant
            )));
        }

        let max_retries = match lookup(&env_key(KEY_MAX_RETRIES)) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                missing(format!("{} must be a non-negative integer", env_key(KEY_MAX_RETRIES)))
            })?,
            None => 0,
        };

        Ok(Self {
            job_id,
            merchant,
            tenant,
            max_retries,
            attempt: attempt_index(&lookup),
        })
    }

    /// No backend retry follows this attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, OrchestratorError> {
    Uuid::parse_str(raw).map_err(|_| missing(format!("{} is not a valid UUID", env_key(KEY_JOB_ID))))
}

fn attempt_index<F>(lookup: &F) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ATTEMPT_ENV)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// Whatever can still be learned from a payload that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialPayload {
    pub job_id: Uuid,
    pub final_attempt: bool,
}

impl PartialPayload {
    pub fn from_vars<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let job_id = lookup(&env_key(KEY_JOB_ID)).and_then(|raw| Uuid::parse_str(raw.trim()).ok())?;
        let max_retries = lookup(&env_key(KEY_MAX_RETRIES))
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(0);
        Some(Self {
            job_id,
            final_attempt: attempt_index(&lookup) >= max_retries,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeeded { records_processed: Option<i64> },
    /// The job was already terminal; nothing was run.
    Skipped { status: JobStatus },
    /// Failed with retries left; the job stays `running`.
    RetryPending { error: String },
    Failed { error: String },
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded { .. } | Self::Skipped { .. } => EXIT_SUCCESS,
            Self::RetryPending { .. } | Self::Failed { .. } => EXIT_FAILURE,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Skipped { .. } => "skipped",
            Self::RetryPending { .. } => "retry_pending",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Run one attempt of the job described by `env`.
#[instrument(skip_all, fields(job_id = %env.job_id, merchant = %env.merchant, attempt = env.attempt))]
pub async fn run(
    db: &DatabaseConnection,
    env: &WorkerEnvironment,
    pipeline: &dyn ExtractionPipeline,
) -> Result<WorkerOutcome, OrchestratorError> {
    let ledger = JobLedger::new(db.clone());
    let sink = LogSink::new(db.clone());

    let job = ledger.get(env.job_id).await?;
    if job.merchant != env.merchant {
        return Err(missing(format!(
            "job {} belongs to '{}', not '{}'",
            job.id, job.merchant, env.merchant
        )));
    }

    let status = job.job_status().map_err(|err| {
        OrchestratorError::Database(sea_orm::DbErr::Type(err.to_string()))
    })?;
    match status {
        JobStatus::Pending => {
            ledger.mark_running(env.job_id).await?;
        }
        JobStatus::Running => {
            sink.info(
                env.job_id,
                &env.merchant,
                COMPONENT,
                &format!("Resuming running job on attempt {}", env.attempt + 1),
            )
            .await;
        }
        terminal => {
            info!(status = %terminal, "Job already terminal, nothing to do");
            let outcome = WorkerOutcome::Skipped { status: terminal };
            counter!("backfill_worker_runs_total", "outcome" => outcome.label()).increment(1);
            return Ok(outcome);
        }
    }

    sink.info(
        env.job_id,
        &env.merchant,
        COMPONENT,
        &format!(
            "Starting historical extraction from {} into {}.{} (attempt {} of {})",
            env.tenant.backfill_start_date,
            env.tenant.warehouse_project,
            env.tenant.warehouse_dataset,
            env.attempt + 1,
            env.max_retries + 1
        ),
    )
    .await;

    let ctx = PipelineContext {
        job_id: env.job_id,
        tenant: env.tenant.clone(),
        sink: sink.clone(),
    };

    let outcome = match pipeline.run(&ctx).await {
        Ok(report) => {
            ledger
                .mark_succeeded(env.job_id, report.records_processed)
                .await?;
            let summary = match report.records_processed {
                Some(records) => format!("Extraction completed, {records} records processed"),
                None => "Extraction completed".to_string(),
            };
            sink.info(env.job_id, &env.merchant, COMPONENT, &summary).await;
            WorkerOutcome::Succeeded {
                records_processed: report.records_processed,
            }
        }
        Err(err) => {
            let error = err.to_string();
            sink.error(env.job_id, &env.merchant, COMPONENT, &error).await;
            if env.is_final_attempt() {
                ledger.mark_failed(env.job_id, error.clone()).await?;
                WorkerOutcome::Failed { error }
            } else {
                warn!(
                    retries_left = env.max_retries - env.attempt,
                    "Attempt failed, leaving job running for backend retry"
                );
                WorkerOutcome::RetryPending { error }
            }
        }
    };

    counter!("backfill_worker_runs_total", "outcome" => outcome.label()).increment(1);
    Ok(outcome)
}

/// Record a payload decoding failure against the job when it can be found.
///
/// Only the final attempt marks the job `failed`; earlier attempts leave it for
/// the backend to retry.
pub async fn record_missing_config(
    db: &DatabaseConnection,
    partial: PartialPayload,
    err: &OrchestratorError,
) -> Result<(), OrchestratorError> {
    let ledger = JobLedger::new(db.clone());
    let sink = LogSink::new(db.clone());

    let Some(job) = ledger.find(partial.job_id).await? else {
        return Ok(());
    };
    let message = err.to_string();
    sink.error(job.id, &job.merchant, COMPONENT, &message).await;

    if partial.final_attempt && !job.job_status().is_ok_and(JobStatus::is_terminal) {
        ledger.mark_failed(job.id, message).await?;
    }
    counter!("backfill_worker_runs_total", "outcome" => "missing_config").increment(1);
    Ok(())
}
