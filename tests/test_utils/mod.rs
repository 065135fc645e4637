//! Test utilities for database testing.
//!
//! Provides an in-memory SQLite database with migrations applied, plus
//! tenant fixtures.

#![allow(dead_code)]

use anyhow::Result;
use backfill_orchestrator::models::tenant_config;
use backfill_orchestrator::repositories::{NewTenantConfig, TenantConfigRepository};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Onboards `merchant` with conventional warehouse settings.
pub async fn create_test_tenant(
    db: &DatabaseConnection,
    merchant: &str,
) -> Result<tenant_config::Model> {
    let shop = merchant.split('.').next().unwrap_or(merchant).replace('-', "_");
    let tenant = TenantConfigRepository::new(db.clone())
        .create(
            NewTenantConfig {
                merchant: merchant.to_string(),
                credential_ref: format!("projects/test/secrets/{shop}-token"),
                warehouse_project: "analytics-test".to_string(),
                warehouse_dataset: format!("shopify_{shop}"),
                backfill_start_date: None,
                metadata: None,
            },
            Some("test"),
        )
        .await?;
    Ok(tenant)
}

/// In-memory database with one active tenant per entry in `merchants`.
pub async fn setup_with_tenants(merchants: &[&str]) -> Result<DatabaseConnection> {
    let db = setup_test_db().await?;
    for merchant in merchants {
        create_test_tenant(&db, merchant).await?;
    }
    Ok(db)
}
