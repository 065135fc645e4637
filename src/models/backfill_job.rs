//! BackfillJob entity model
//!
//! This module contains the SeaORM entity model for the backfill_jobs table,
//! the durable ledger of every orchestration attempt.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

use super::status::{JobStatus, UnknownStatus};

/// One orchestration attempt for one merchant
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "backfill_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Merchant the job extracts for
    pub merchant: String,

    /// Type of job; always `historical_load` for backfills
    pub job_type: String,

    /// Lifecycle state (pending, running, succeeded, failed)
    pub status: String,

    /// Resolved execution unit name, set once the unit exists
    pub unit_name: Option<String>,

    /// Backend-assigned execution identifier, when the backend reports one
    pub execution_name: Option<String>,

    /// Timestamp the attempt was recorded
    pub started_at: DateTimeWithTimeZone,

    /// Timestamp the job reached a terminal state
    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Captured error text for failed jobs
    pub error_message: Option<String>,

    /// Rows written by the extraction pipeline
    pub records_processed: Option<i64>,

    /// Wall-clock seconds between start and completion
    pub duration_seconds: Option<i64>,

    /// Operator or system that requested the backfill
    pub created_by: Option<String>,

    /// Timestamp of the last ledger write
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn job_status(&self) -> Result<JobStatus, UnknownStatus> {
        self.status.parse()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant_config::Entity",
        from = "Column::Merchant",
        to = "super::tenant_config::Column::Merchant"
    )]
    TenantConfig,
    #[sea_orm(has_many = "super::job_log::Entity")]
    JobLog,
}

impl Related<super::tenant_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TenantConfig.def()
    }
}

impl Related<super::job_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
