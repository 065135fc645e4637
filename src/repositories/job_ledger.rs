//! # Job Ledger
//!
//! Durable record of every orchestration attempt in `backfill_jobs`.
//!
//! Two properties are enforced by the database rather than by callers:
//!
//! - at most one `pending`/`running` row per merchant, via the partial unique
//!   index `idx_backfill_jobs_in_flight`; [`JobLedger::create_pending`] treats
//!   the insert itself as the atomic check.
//! - status changes only along permitted edges; [`JobLedger::transition`] is a
//!   conditional `UPDATE ... WHERE status IN (<predecessors>)`.

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::error::{OrchestratorError, is_unique_violation};
use crate::models::HISTORICAL_LOAD;
use crate::models::JobStatus;
use crate::models::backfill_job::{ActiveModel, Column, Entity, Model};

/// Attempts to either win the in-flight slot or read the winner.
const CREATE_ATTEMPTS: usize = 3;

/// Result of [`JobLedger::create_pending`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new `pending` record was inserted.
    Created(Model),
    /// A non-terminal record already existed and is returned unchanged.
    Existing(Model),
}

impl CreateOutcome {
    pub fn job(&self) -> &Model {
        match self {
            Self::Created(job) | Self::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Model {
        match self {
            Self::Created(job) | Self::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Filters for [`JobLedger::list`]
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub merchant: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
}

/// Fields written alongside a status change
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
}

/// Repository for `backfill_jobs`
#[derive(Clone)]
pub struct JobLedger {
    db: DatabaseConnection,
}

impl JobLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a `pending` record for `merchant` unless one is already in flight.
    ///
    /// A losing concurrent insert surfaces as a unique violation; the loser then
    /// reads and returns the winner's record.
    pub async fn create_pending(
        &self,
        merchant: &str,
        created_by: Option<&str>,
    ) -> Result<CreateOutcome, OrchestratorError> {
        for attempt in 1..=CREATE_ATTEMPTS {
            if let Some(existing) = self.in_flight_for(merchant).await? {
                return Ok(CreateOutcome::Existing(existing));
            }

            let now = Utc::now().fixed_offset();
            let job = ActiveModel {
                id: Set(Uuid::new_v4()),
                merchant: Set(merchant.to_string()),
                job_type: Set(HISTORICAL_LOAD.to_string()),
                status: Set(JobStatus::Pending.as_str().to_string()),
                unit_name: Set(None),
                execution_name: Set(None),
                started_at: Set(now),
                completed_at: Set(None),
                error_message: Set(None),
                records_processed: Set(None),
                duration_seconds: Set(None),
                created_by: Set(created_by.map(str::to_string)),
                updated_at: Set(now),
            };

            match job.insert(&self.db).await {
                Ok(created) => {
                    tracing::info!(
                        merchant = %merchant,
                        job_id = %created.id,
                        "Pending backfill job recorded"
                    );
                    return Ok(CreateOutcome::Created(created));
                }
                Err(err) if is_unique_violation(&err) => {
                    tracing::debug!(
                        merchant = %merchant,
                        attempt,
                        "Lost in-flight slot race, reading existing job"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        // The slot kept flipping between terminal and in-flight under us.
        Err(OrchestratorError::LedgerWriteConflict {
            merchant: merchant.to_string(),
        })
    }

    pub async fn find(&self, job_id: Uuid) -> Result<Option<Model>, OrchestratorError> {
        Ok(Entity::find_by_id(job_id).one(&self.db).await?)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Model, OrchestratorError> {
        self.find(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound { job_id })
    }

    /// The merchant's `pending` or `running` record, if any.
    pub async fn in_flight_for(&self, merchant: &str) -> Result<Option<Model>, OrchestratorError> {
        Ok(Entity::find()
            .filter(Column::Merchant.eq(merchant))
            .filter(Column::Status.is_in(JobStatus::NON_TERMINAL.map(JobStatus::as_str)))
            .one(&self.db)
            .await?)
    }

    /// Move a job to `to`, rejecting anything but a permitted edge.
    ///
    /// Entering a terminal state stamps `completed_at` and `duration_seconds`.
    pub async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Model, OrchestratorError> {
        let current = self.get(job_id).await?;
        let from = parse_status(&current)?;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition { job_id, from, to });
        }

        let now = Utc::now().fixed_offset();
        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now));

        if to.is_terminal() {
            let duration = (now - current.started_at).num_seconds().max(0);
            update = update
                .col_expr(Column::CompletedAt, Expr::value(Some(now)))
                .col_expr(Column::DurationSeconds, Expr::value(Some(duration)));
        }
        if let Some(message) = fields.error_message {
            update = update.col_expr(Column::ErrorMessage, Expr::value(Some(message)));
        }
        if let Some(records) = fields.records_processed {
            update = update.col_expr(Column::RecordsProcessed, Expr::value(Some(records)));
        }

        let result = update
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.is_in(to.predecessors().iter().map(|s| s.as_str())))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Someone else moved the job between our read and the update.
            let latest = self.get(job_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                job_id,
                from: parse_status(&latest)?,
                to,
            });
        }

        tracing::info!(
            job_id = %job_id,
            merchant = %current.merchant,
            from = %from,
            to = %to,
            "Job status changed"
        );

        self.get(job_id).await
    }

    pub async fn mark_running(&self, job_id: Uuid) -> Result<Model, OrchestratorError> {
        self.transition(job_id, JobStatus::Running, TransitionFields::default())
            .await
    }

    pub async fn mark_succeeded(
        &self,
        job_id: Uuid,
        records_processed: Option<i64>,
    ) -> Result<Model, OrchestratorError> {
        self.transition(
            job_id,
            JobStatus::Succeeded,
            TransitionFields {
                error_message: None,
                records_processed,
            },
        )
        .await
    }

    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        error_message: impl Into<String>,
    ) -> Result<Model, OrchestratorError> {
        self.transition(
            job_id,
            JobStatus::Failed,
            TransitionFields {
                error_message: Some(error_message.into()),
                records_processed: None,
            },
        )
        .await
    }

    /// Persist the resolved execution unit name on a job.
    pub async fn record_unit_name(
        &self,
        job_id: Uuid,
        unit_name: &str,
    ) -> Result<(), OrchestratorError> {
        self.set_text_column(job_id, Column::UnitName, unit_name).await
    }

    /// Persist the backend's execution identifier on a job.
    pub async fn record_execution_name(
        &self,
        job_id: Uuid,
        execution_name: &str,
    ) -> Result<(), OrchestratorError> {
        self.set_text_column(job_id, Column::ExecutionName, execution_name)
            .await
    }

    async fn set_text_column(
        &self,
        job_id: Uuid,
        column: Column,
        value: &str,
    ) -> Result<(), OrchestratorError> {
        let result = Entity::update_many()
            .col_expr(column, Expr::value(Some(value.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(OrchestratorError::JobNotFound { job_id });
        }
        Ok(())
    }

    /// Unit name resolved by the merchant's most recent job, if any.
    pub async fn last_unit_name(&self, merchant: &str) -> Result<Option<String>, OrchestratorError> {
        let job = Entity::find()
            .filter(Column::Merchant.eq(merchant))
            .filter(Column::UnitName.is_not_null())
            .order_by_desc(Column::StartedAt)
            .one(&self.db)
            .await?;
        Ok(job.and_then(|job| job.unit_name))
    }

    /// Jobs matching `filter`, newest first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Model>, OrchestratorError> {
        let mut query = Entity::find().order_by_desc(Column::StartedAt);

        if let Some(merchant) = filter.merchant {
            query = query.filter(Column::Merchant.eq(merchant));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        Ok(query.all(&self.db).await?)
    }

    pub async fn recent(&self, limit: u64) -> Result<Vec<Model>, OrchestratorError> {
        self.list(JobFilter {
            limit: Some(limit),
            ..JobFilter::default()
        })
        .await
    }

    pub async fn history(
        &self,
        merchant: &str,
        limit: u64,
    ) -> Result<Vec<Model>, OrchestratorError> {
        self.list(JobFilter {
            merchant: Some(merchant.to_string()),
            limit: Some(limit),
            ..JobFilter::default()
        })
        .await
    }

    /// All `pending` and `running` jobs, oldest first.
    pub async fn active(&self) -> Result<Vec<Model>, OrchestratorError> {
        Ok(Entity::find()
            .filter(Column::Status.is_in(JobStatus::NON_TERMINAL.map(JobStatus::as_str)))
            .order_by_asc(Column::StartedAt)
            .all(&self.db)
            .await?)
    }

    /// Fail `pending` jobs recorded before `now - older_than`.
    ///
    /// A job that has moved on by the time it is reached is skipped.
    pub async fn fail_stale_pending(
        &self,
        older_than: Duration,
    ) -> Result<Vec<Model>, OrchestratorError> {
        let hours = older_than.num_hours();
        self.fail_stale(
            JobStatus::Pending,
            older_than,
            &format!("Job timeout - stuck in pending for over {hours} hours"),
        )
        .await
    }

    /// Fail `running` jobs started before `now - older_than`.
    ///
    /// Covers workers killed by the platform before they could record an
    /// outcome. `older_than` should exceed the backend's task timeout across
    /// all retries.
    pub async fn fail_stale_running(
        &self,
        older_than: Duration,
    ) -> Result<Vec<Model>, OrchestratorError> {
        let hours = older_than.num_hours();
        self.fail_stale(
            JobStatus::Running,
            older_than,
            &format!("Job timeout - running for over {hours} hours without an outcome"),
        )
        .await
    }

    async fn fail_stale(
        &self,
        status: JobStatus,
        older_than: Duration,
        message: &str,
    ) -> Result<Vec<Model>, OrchestratorError> {
        let cutoff = (Utc::now() - older_than).fixed_offset();
        let stale = Entity::find()
            .filter(Column::Status.eq(status.as_str()))
            .filter(Column::StartedAt.lt(cutoff))
            .order_by_asc(Column::StartedAt)
            .all(&self.db)
            .await?;

        let mut failed = Vec::with_capacity(stale.len());
        for job in stale {
            match self.mark_failed(job.id, message).await {
                Ok(updated) => failed.push(updated),
                Err(OrchestratorError::InvalidTransition { .. }) => {
                    tracing::debug!(job_id = %job.id, "Stale job moved on before reaping");
                }
                Err(err) => return Err(err),
            }
        }

        if !failed.is_empty() {
            tracing::warn!(
                count = failed.len(),
                status = %status,
                hours = older_than.num_hours(),
                "Failed stale jobs"
            );
        }
        Ok(failed)
    }
}

fn parse_status(job: &Model) -> Result<JobStatus, OrchestratorError> {
    job.job_status().map_err(|err| {
        OrchestratorError::Database(sea_orm::DbErr::Type(format!(
            "job {} has {}",
            job.id, err
        )))
    })
}
