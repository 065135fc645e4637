//! Job Orchestrator
//!
//! Single entry point for "run the backfill for merchant M". Records the
//! attempt, resolves the merchant's execution unit (walking versioned names on
//! collisions), and hands the tenant snapshot to the execution backend.
//!
//! The orchestrator holds no mutable state. Every cross-request decision goes
//! through the job ledger, so any number of replicas may serve requests.

use std::sync::Arc;

use chrono::Duration;
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::backend::{
    BackendError, ExecutionBackend, ExecutionHandle, ExecutionOutcome, LaunchPayload,
    ResourceLimits, TenantSnapshot, UnitRef, UnitSpec,
};
use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::models::{JobStatus, backfill_job, tenant_config};
use crate::naming::{canonical_unit_name, unit_name_candidates};
use crate::repositories::{CreateOutcome, JobLedger, LogSink, TenantConfigRepository};

const COMPONENT: &str = "orchestrator";

/// What a caller gets back from [`JobOrchestrator::request_backfill`].
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub merchant: String,
    pub status: JobStatus,
    pub unit_name: Option<String>,
    pub execution_name: Option<String>,
    pub error_message: Option<String>,
    /// False when an already in-flight job was returned.
    pub created: bool,
}

impl JobHandle {
    fn from_job(job: &backfill_job::Model, created: bool) -> Result<Self, OrchestratorError> {
        let status = job.job_status().map_err(|err| {
            OrchestratorError::Database(sea_orm::DbErr::Type(err.to_string()))
        })?;
        Ok(Self {
            job_id: job.id,
            merchant: job.merchant.clone(),
            status,
            unit_name: job.unit_name.clone(),
            execution_name: job.execution_name.clone(),
            error_message: job.error_message.clone(),
            created,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub limits: ResourceLimits,
    pub max_unit_name_versions: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: ResourceLimits::from_config(config),
            max_unit_name_versions: config.max_unit_name_versions,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            max_unit_name_versions: 20,
        }
    }
}

#[derive(Clone)]
pub struct JobOrchestrator {
    tenants: TenantConfigRepository,
    ledger: JobLedger,
    sink: LogSink,
    backend: Arc<dyn ExecutionBackend>,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        db: DatabaseConnection,
        backend: Arc<dyn ExecutionBackend>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            tenants: TenantConfigRepository::new(db.clone()),
            ledger: JobLedger::new(db.clone()),
            sink: LogSink::new(db),
            backend,
            settings,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Start, or join, the backfill for `merchant`.
    ///
    /// Returns the in-flight job unchanged if one exists. Handoff failures are
    /// recorded on the job as `Failed` and still return its handle; only an
    /// unknown or inactive merchant is rejected outright.
    #[instrument(skip(self), fields(backend = %self.backend.kind()))]
    pub async fn request_backfill(
        &self,
        merchant: &str,
        requested_by: Option<&str>,
    ) -> Result<JobHandle, OrchestratorError> {
        let tenant = match self.tenants.find_active(merchant).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) | Err(OrchestratorError::Validation { .. }) => {
                counter!("backfill_requests_total", "outcome" => "unknown_tenant").increment(1);
                warn!(merchant = %merchant, "Backfill requested for unknown or inactive tenant");
                return Err(OrchestratorError::UnknownTenant {
                    merchant: merchant.trim().to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let job = match self
            .ledger
            .create_pending(&tenant.merchant, requested_by)
            .await?
        {
            CreateOutcome::Existing(job) => {
                counter!("backfill_requests_total", "outcome" => "existing").increment(1);
                info!(
                    merchant = %tenant.merchant,
                    job_id = %job.id,
                    status = %job.status,
                    "Backfill already in flight, returning existing job"
                );
                return JobHandle::from_job(&job, false);
            }
            CreateOutcome::Created(job) => job,
        };

        self.sink
            .info(
                job.id,
                &tenant.merchant,
                COMPONENT,
                &format!(
                    "Backfill requested by {} via {} backend",
                    requested_by.unwrap_or("system"),
                    self.backend.kind()
                ),
            )
            .await;

        let outcome = match self.hand_off(&job, &tenant).await {
            Ok(handle) => self.settle_completed(&job, &tenant, &handle).await,
            Err(err) => {
                self.record_handoff_failure(&job, &tenant, &err).await;
                err.kind()
            }
        };
        counter!("backfill_requests_total", "outcome" => outcome).increment(1);

        let latest = self.ledger.get(job.id).await?;
        JobHandle::from_job(&latest, true)
    }

    async fn hand_off(
        &self,
        job: &backfill_job::Model,
        tenant: &tenant_config::Model,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        let unit = self.resolve_unit(job, tenant).await?;
        self.ledger.record_unit_name(job.id, &unit.name).await?;
        self.sink
            .info(
                job.id,
                &tenant.merchant,
                COMPONENT,
                &format!(
                    "{} execution unit {}",
                    if unit.created { "Created" } else { "Reusing" },
                    unit.name
                ),
            )
            .await;

        let payload = LaunchPayload::new(
            job.id,
            &TenantSnapshot::from(tenant),
            self.backend.retry_budget(),
        )
        .map_err(|err| OrchestratorError::LaunchFailed {
            unit_name: unit.name.clone(),
            message: format!("failed to serialize tenant snapshot: {err}"),
        })?;

        let handle = self
            .backend
            .launch(&unit, &payload)
            .await
            .map_err(|err| OrchestratorError::LaunchFailed {
                unit_name: unit.name.clone(),
                message: err.to_string(),
            })?;

        if let Some(execution_name) = &handle.execution_name {
            self.ledger
                .record_execution_name(job.id, execution_name)
                .await?;
        }
        info!(
            merchant = %tenant.merchant,
            job_id = %job.id,
            unit_name = %unit.name,
            execution = handle.execution_name.as_deref().unwrap_or_default(),
            "Execution handed off"
        );
        Ok(handle)
    }

    /// Find the first candidate name the backend lets this merchant use.
    async fn resolve_unit(
        &self,
        job: &backfill_job::Model,
        tenant: &tenant_config::Model,
    ) -> Result<UnitRef, OrchestratorError> {
        let previous = self.ledger.last_unit_name(&tenant.merchant).await?;
        let candidates = unit_name_candidates(
            &tenant.merchant,
            previous.as_deref(),
            self.settings.max_unit_name_versions,
        );

        for name in candidates {
            let spec = UnitSpec {
                name: name.clone(),
                merchant: tenant.merchant.clone(),
                limits: self.settings.limits.clone(),
            };
            match self.backend.ensure_unit(&spec).await {
                Ok(unit) => return Ok(unit),
                Err(BackendError::NameCollision { name, owner }) => {
                    counter!("backfill_unit_name_collisions_total").increment(1);
                    self.sink
                        .warn(
                            job.id,
                            &tenant.merchant,
                            COMPONENT,
                            &format!("Execution unit name {name} is taken by {owner}, trying next"),
                        )
                        .await;
                }
                Err(err) => {
                    return Err(OrchestratorError::UnitCreationFailed {
                        unit_name: name,
                        message: err.to_string(),
                    });
                }
            }
        }

        Err(OrchestratorError::UnitCreationFailed {
            unit_name: canonical_unit_name(&tenant.merchant),
            message: format!(
                "no free execution unit name within {} versions",
                self.settings.max_unit_name_versions
            ),
        })
    }

    /// For blocking backends the run is already over; make sure the ledger
    /// reflects a non-zero exit even if the worker never got to write it.
    async fn settle_completed(
        &self,
        job: &backfill_job::Model,
        tenant: &tenant_config::Model,
        handle: &ExecutionHandle,
    ) -> &'static str {
        let ExecutionOutcome::Completed { exit_code } = handle.outcome else {
            return "launched";
        };

        let current = match self.ledger.get(job.id).await {
            Ok(current) => current,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "Could not re-read job after local run");
                return "completed";
            }
        };
        if !current.job_status().is_ok_and(JobStatus::is_terminal) {
            let message = format!("worker exited with code {exit_code} without completing the job");
            self.sink
                .error(job.id, &tenant.merchant, COMPONENT, &message)
                .await;
            if let Err(err) = self.ledger.mark_failed(job.id, message).await {
                warn!(job_id = %job.id, error = %err, "Failed to record local worker exit");
            }
            return "failed";
        }
        if exit_code == 0 { "completed" } else { "failed" }
    }

    async fn record_handoff_failure(
        &self,
        job: &backfill_job::Model,
        tenant: &tenant_config::Model,
        err: &OrchestratorError,
    ) {
        let message = err.to_string();
        self.sink
            .error(job.id, &tenant.merchant, COMPONENT, &message)
            .await;

        match self.ledger.mark_failed(job.id, message).await {
            Ok(_) => {}
            Err(OrchestratorError::InvalidTransition { from, .. }) => {
                warn!(job_id = %job.id, status = %from, "Job left pending before handoff failure was recorded");
            }
            Err(record_err) => {
                tracing::error!(
                    job_id = %job.id,
                    error = %record_err,
                    "Failed to record handoff failure"
                );
            }
        }
    }

    /// Fail jobs that never left `pending` within `older_than`.
    pub async fn reap_stale_pending(
        &self,
        older_than: Duration,
    ) -> Result<Vec<backfill_job::Model>, OrchestratorError> {
        let failed = self.ledger.fail_stale_pending(older_than).await?;
        self.log_reaped(&failed, "stuck in pending").await;
        Ok(failed)
    }

    /// Fail jobs still `running` after `older_than`; their worker is gone.
    pub async fn reap_stale_running(
        &self,
        older_than: Duration,
    ) -> Result<Vec<backfill_job::Model>, OrchestratorError> {
        let failed = self.ledger.fail_stale_running(older_than).await?;
        self.log_reaped(&failed, "no outcome recorded").await;
        Ok(failed)
    }

    async fn log_reaped(&self, failed: &[backfill_job::Model], fallback: &str) {
        for job in failed {
            self.sink
                .error(
                    job.id,
                    &job.merchant,
                    COMPONENT,
                    job.error_message.as_deref().unwrap_or(fallback),
                )
                .await;
        }
    }
}
