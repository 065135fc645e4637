//! # Repository Layer
//!
//! Repositories wrap an injected [`sea_orm::DatabaseConnection`] and expose the
//! insert, conditional-update and filtered-read operations the orchestrator needs.

pub mod job_ledger;
pub mod log_sink;
pub mod tenant_config;

pub use job_ledger::{CreateOutcome, JobFilter, JobLedger, TransitionFields};
pub use log_sink::{ErrorSummary, LogSink, MAX_MESSAGE_CHARS, SummaryLine};
pub use tenant_config::{NewTenantConfig, TenantConfigPatch, TenantConfigRepository};
