//! Migration to create the backfill_jobs table.
//!
//! Every orchestration attempt gets one row. Rows are only ever inserted and
//! conditionally updated; the table doubles as the audit trail.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BackfillJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BackfillJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(BackfillJobs::Merchant).text().not_null())
                    .col(
                        ColumnDef::new(BackfillJobs::JobType)
                            .text()
                            .not_null()
                            .default("historical_load"),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(BackfillJobs::UnitName).text().null())
                    .col(ColumnDef::new(BackfillJobs::ExecutionName).text().null())
                    .col(
                        ColumnDef::new(BackfillJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(BackfillJobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(BackfillJobs::RecordsProcessed)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::DurationSeconds)
                            .big_integer()
                            .null(),
                    )
                    .col(ColumnDef::new(BackfillJobs::CreatedBy).text().null())
                    .col(
                        ColumnDef::new(BackfillJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_backfill_jobs_merchant")
                            .from(BackfillJobs::Table, BackfillJobs::Merchant)
                            .to(TenantConfigs::Table, TenantConfigs::Merchant)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // History views read newest-first per merchant
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_backfill_jobs_merchant_started ON backfill_jobs (merchant, started_at DESC)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_backfill_jobs_status_started")
                    .table(BackfillJobs::Table)
                    .col(BackfillJobs::Status)
                    .col(BackfillJobs::StartedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobLogs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobLogs::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(JobLogs::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(JobLogs::Level).text().not_null())
                    .col(ColumnDef::new(JobLogs::Message).text().not_null())
                    .col(ColumnDef::new(JobLogs::Merchant).text().null())
                    .col(ColumnDef::new(JobLogs::Component).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_logs_job_id")
                            .from(JobLogs::Table, JobLogs::JobId)
                            .to(BackfillJobs::Table, BackfillJobs::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_logs_job_timestamp")
                    .table(JobLogs::Table)
                    .col(JobLogs::JobId)
                    .col(JobLogs::Timestamp)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_job_logs_job_timestamp").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobLogs::Table).to_owned())
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_backfill_jobs_merchant_started")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_backfill_jobs_status_started")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(BackfillJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum BackfillJobs {
    Table,
    Id,
    Merchant,
    JobType,
    Status,
    UnitName,
    ExecutionName,
    StartedAt,
    CompletedAt,
    ErrorMessage,
    RecordsProcessed,
    DurationSeconds,
    CreatedBy,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum JobLogs {
    Table,
    Id,
    JobId,
    Timestamp,
    Level,
    Message,
    Merchant,
    Component,
}

#[derive(DeriveIden)]
enum TenantConfigs {
    Table,
    Merchant,
}
