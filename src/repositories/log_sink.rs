//! # Job Log Sink
//!
//! Append-only diagnostic lines attached to a job id. Every line is also
//! mirrored to `tracing` at the matching level so process logs and the
//! persisted trail agree.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::models::LogLevel;
use crate::models::job_log::{ActiveModel, Column, Entity, Model};

/// Longest message stored; anything longer is cut at a char boundary.
pub const MAX_MESSAGE_CHARS: usize = 1000;

const SUMMARY_RECENT_LIMIT: u64 = 10;

/// Error and warning counts for one job, with the latest errors.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorSummary {
    pub job_id: Uuid,
    pub error_count: u64,
    pub warning_count: u64,
    /// Most recent ERROR and WARNING lines, newest first
    pub recent: Vec<SummaryLine>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SummaryLine {
    pub timestamp: DateTime<FixedOffset>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone)]
pub struct LogSink {
    db: DatabaseConnection,
}

impl LogSink {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        merchant: Option<&str>,
        component: Option<&str>,
    ) -> Result<Model, OrchestratorError> {
        let message = truncate(message);

        match level {
            LogLevel::Info => tracing::info!(
                job_id = %job_id,
                merchant = merchant.unwrap_or_default(),
                component = component.unwrap_or_default(),
                "{message}"
            ),
            LogLevel::Warning => tracing::warn!(
                job_id = %job_id,
                merchant = merchant.unwrap_or_default(),
                component = component.unwrap_or_default(),
                "{message}"
            ),
            LogLevel::Error => tracing::error!(
                job_id = %job_id,
                merchant = merchant.unwrap_or_default(),
                component = component.unwrap_or_default(),
                "{message}"
            ),
        }

        let line = ActiveModel {
            job_id: Set(job_id),
            timestamp: Set(Utc::now().fixed_offset()),
            level: Set(level.as_str().to_string()),
            message: Set(message),
            merchant: Set(merchant.map(str::to_string)),
            component: Set(component.map(str::to_string)),
            ..Default::default()
        };

        Ok(line.insert(&self.db).await?)
    }

    /// Append without propagating storage errors.
    ///
    /// Diagnostics must never change a job's outcome; a failed write is only
    /// reported through `tracing`.
    pub async fn record(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        merchant: Option<&str>,
        component: Option<&str>,
    ) {
        if let Err(err) = self
            .append(job_id, level, message, merchant, component)
            .await
        {
            tracing::warn!(job_id = %job_id, error = %err, "Failed to persist job log line");
        }
    }

    pub async fn info(&self, job_id: Uuid, merchant: &str, component: &str, message: &str) {
        self.record(job_id, LogLevel::Info, message, Some(merchant), Some(component))
            .await;
    }

    pub async fn warn(&self, job_id: Uuid, merchant: &str, component: &str, message: &str) {
        self.record(
            job_id,
            LogLevel::Warning,
            message,
            Some(merchant),
            Some(component),
        )
        .await;
    }

    pub async fn error(&self, job_id: Uuid, merchant: &str, component: &str, message: &str) {
        self.record(job_id, LogLevel::Error, message, Some(merchant), Some(component))
            .await;
    }

    /// Lines for a job in write order, optionally filtered by level.
    pub async fn for_job(
        &self,
        job_id: Uuid,
        level: Option<LogLevel>,
        limit: Option<u64>,
    ) -> Result<Vec<Model>, OrchestratorError> {
        let mut query = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::Timestamp)
            .order_by_asc(Column::Id);

        if let Some(level) = level {
            query = query.filter(Column::Level.eq(level.as_str()));
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        Ok(query.all(&self.db).await?)
    }

    pub async fn error_summary(&self, job_id: Uuid) -> Result<ErrorSummary, OrchestratorError> {
        let error_count = self.count_level(job_id, LogLevel::Error).await?;
        let warning_count = self.count_level(job_id, LogLevel::Warning).await?;

        let recent = Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Level.is_in([LogLevel::Error.as_str(), LogLevel::Warning.as_str()]))
            .order_by_desc(Column::Timestamp)
            .order_by_desc(Column::Id)
            .limit(SUMMARY_RECENT_LIMIT)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|line| SummaryLine {
                level: line.level.parse().unwrap_or(LogLevel::Error),
                timestamp: line.timestamp,
                message: line.message,
            })
            .collect();

        Ok(ErrorSummary {
            job_id,
            error_count,
            warning_count,
            recent,
        })
    }

    async fn count_level(&self, job_id: Uuid, level: LogLevel) -> Result<u64, OrchestratorError> {
        Ok(Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Level.eq(level.as_str()))
            .count(&self.db)
            .await?)
    }
}

fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}
