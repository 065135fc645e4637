//! TenantConfig entity model
//!
//! Per-merchant settings consumed by the orchestrator when it builds a launch
//! payload. Rows are soft-deactivated, never deleted.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tenant_configs")]
pub struct Model {
    /// Shop domain, e.g. `acme.myshopify.com` (primary key, immutable)
    #[sea_orm(primary_key, auto_increment = false)]
    pub merchant: String,

    /// Reference to the API credential in the secret store, never the secret itself
    pub credential_ref: String,

    /// Warehouse project the pipeline writes into
    pub warehouse_project: String,

    /// Warehouse dataset the pipeline writes into
    pub warehouse_dataset: String,

    /// Earliest order date the historical backfill extracts
    pub backfill_start_date: Date,

    /// Inactive tenants are rejected by the orchestrator
    pub is_active: bool,

    /// Free-form onboarding metadata
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub created_by: Option<String>,
    pub updated_at: DateTimeWithTimeZone,
    pub updated_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::backfill_job::Entity")]
    BackfillJob,
}

impl Related<super::backfill_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackfillJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
