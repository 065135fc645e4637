//! Database migrations for the backfill orchestrator.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_090000_create_tenant_configs;
mod m2026_01_05_090100_create_backfill_jobs;
mod m2026_01_05_090200_add_backfill_in_flight_guard;

/// Name of the partial unique index that admits one in-flight job per merchant.
pub const IN_FLIGHT_INDEX: &str = "idx_backfill_jobs_in_flight";

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_090000_create_tenant_configs::Migration),
            Box::new(m2026_01_05_090100_create_backfill_jobs::Migration),
            Box::new(m2026_01_05_090200_add_backfill_in_flight_guard::Migration),
        ]
    }
}
