//! Extraction pipeline seam.
//!
//! The extraction itself lives outside this crate. The worker only needs
//! "run to completion or fail", plus the pipeline's output captured into the
//! job log. [`CommandPipeline`] runs the configured command with the tenant
//! snapshot in its environment and forwards every output line to the sink.

use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::TenantSnapshot;
use crate::models::LogLevel;
use crate::repositories::LogSink;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no extraction pipeline command is configured")]
    NotConfigured,
    #[error("failed to start extraction pipeline: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("extraction pipeline exited with code {code}: {last_error}")]
    Exited { code: i32, last_error: String },
    #[error("{0}")]
    Failed(String),
}

/// Everything a pipeline run needs to know about its job.
#[derive(Clone)]
pub struct PipelineContext {
    pub job_id: Uuid,
    pub tenant: TenantSnapshot,
    pub sink: LogSink,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub records_processed: Option<i64>,
}

#[async_trait]
pub trait ExtractionPipeline: Send + Sync {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineReport, PipelineError>;
}

/// Runs an external extraction command through `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    command: String,
}

impl CommandPipeline {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn environment(ctx: &PipelineContext) -> Result<Vec<(&'static str, String)>, PipelineError> {
        let snapshot = serde_json::to_string(&ctx.tenant)
            .map_err(|err| PipelineError::Failed(format!("failed to encode tenant: {err}")))?;
        Ok(vec![
            ("TARGET_STORE", ctx.tenant.merchant.clone()),
            ("PIPELINE_TYPE", "historical".to_string()),
            ("PIPELINE_JOB_ID", ctx.job_id.to_string()),
            ("STORE_CONFIG_JSON", snapshot),
            ("CREDENTIAL_REF", ctx.tenant.credential_ref.clone()),
            ("WAREHOUSE_PROJECT", ctx.tenant.warehouse_project.clone()),
            ("WAREHOUSE_DATASET", ctx.tenant.warehouse_dataset.clone()),
            (
                "BACKFILL_START_DATE",
                ctx.tenant.backfill_start_date.format("%Y-%m-%d").to_string(),
            ),
        ])
    }
}

#[async_trait]
impl ExtractionPipeline for CommandPipeline {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineReport, PipelineError> {
        if self.command.trim().is_empty() {
            return Err(PipelineError::NotConfigured);
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(Self::environment(ctx)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut report = PipelineReport::default();
        let mut last_error = String::new();
        while let Some(line) = rx.recv().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (level, component) = classify_line(line);
            if level == LogLevel::Error {
                last_error = line.to_string();
            }
            if let Some(records) = parse_records_processed(line) {
                report.records_processed = Some(records);
            }
            ctx.sink
                .record(
                    ctx.job_id,
                    level,
                    line,
                    Some(&ctx.tenant.merchant),
                    Some(component),
                )
                .await;
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(report)
        } else {
            Err(PipelineError::Exited {
                code: status.code().unwrap_or(-1),
                last_error: if last_error.is_empty() {
                    "no error output captured".to_string()
                } else {
                    last_error
                },
            })
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "Stopped reading pipeline output");
                break;
            }
        }
    }
}

/// Level and component for one line of pipeline output.
pub fn classify_line(line: &str) -> (LogLevel, &'static str) {
    let level = if line.contains("[ERROR]") || line.contains("Error") || line.contains("error") {
        LogLevel::Error
    } else if line.contains("[WARNING]") || line.contains("Warning") {
        LogLevel::Warning
    } else {
        LogLevel::Info
    };

    let component = ["customers", "order_items", "orders", "products"]
        .into_iter()
        .find(|component| line.contains(component))
        .unwrap_or("main");

    (level, component)
}

fn records_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)records[ _]processed\s*[:=]\s*(\d+)").ok())
        .as_ref()
}

/// Extract a `records processed: N` count from a line, if present.
pub fn parse_records_processed(line: &str) -> Option<i64> {
    records_pattern()?
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|count| count.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_classified_by_level_and_component() {
        assert_eq!(
            classify_line("[ERROR] orders page 3 failed"),
            (LogLevel::Error, "orders")
        );
        assert_eq!(
            classify_line("Warning: throttled fetching order_items"),
            (LogLevel::Warning, "order_items")
        );
        assert_eq!(
            classify_line("Fetched 250 customers"),
            (LogLevel::Info, "customers")
        );
        assert_eq!(classify_line("starting up"), (LogLevel::Info, "main"));
    }

    #[test]
    fn record_counts_are_extracted() {
        assert_eq!(parse_records_processed("Records processed: 1234"), Some(1234));
        assert_eq!(parse_records_processed("records_processed=7"), Some(7));
        assert_eq!(parse_records_processed("processed some records"), None);
    }
}
