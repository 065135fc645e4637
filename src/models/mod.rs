//! # Data Models
//!
//! SeaORM entities for tenant configuration, the job ledger and the job log
//! sink, plus the status enums stored in them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod backfill_job;
pub mod job_log;
pub mod status;
pub mod tenant_config;

pub use backfill_job::Entity as BackfillJob;
pub use job_log::Entity as JobLog;
pub use status::{JobStatus, LogLevel};
pub use tenant_config::Entity as TenantConfig;

/// Job type recorded for historical backfills.
pub const HISTORICAL_LOAD: &str = "historical_load";

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "backfill-orchestrator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
