//! JobLog entity model
//!
//! Append-only diagnostic lines keyed by job id.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_logs")]
pub struct Model {
    /// Insertion sequence; breaks timestamp ties
    #[sea_orm(primary_key)]
    pub id: i32,

    pub job_id: Uuid,

    pub timestamp: DateTimeWithTimeZone,

    /// INFO, WARNING or ERROR
    pub level: String,

    pub message: String,

    pub merchant: Option<String>,

    /// Originating component, e.g. `orchestrator`, `worker`, `orders`
    pub component: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::backfill_job::Entity",
        from = "Column::JobId",
        to = "super::backfill_job::Column::Id"
    )]
    BackfillJob,
}

impl Related<super::backfill_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackfillJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
