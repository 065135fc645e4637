//! Migration to create the tenant_configs table.
//!
//! One row per onboarded merchant, keyed by the merchant's shop domain. Rows are
//! deactivated rather than deleted.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TenantConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TenantConfigs::Merchant)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TenantConfigs::CredentialRef).text().not_null())
                    .col(
                        ColumnDef::new(TenantConfigs::WarehouseProject)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TenantConfigs::WarehouseDataset)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TenantConfigs::BackfillStartDate)
                            .date()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TenantConfigs::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(TenantConfigs::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(TenantConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(TenantConfigs::CreatedBy).text().null())
                    .col(
                        ColumnDef::new(TenantConfigs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(TenantConfigs::UpdatedBy).text().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tenant_configs_active")
                    .table(TenantConfigs::Table)
                    .col(TenantConfigs::IsActive)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_tenant_configs_active").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TenantConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TenantConfigs {
    Table,
    Merchant,
    CredentialRef,
    WarehouseProject,
    WarehouseDataset,
    BackfillStartDate,
    IsActive,
    Metadata,
    CreatedAt,
    CreatedBy,
    UpdatedAt,
    UpdatedBy,
}
