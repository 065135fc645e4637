//! # Command Line Interface
//!
//! One binary serves the API, runs migrations, administers tenants, requests
//! backfills and acts as the worker entry point inside execution units.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::backend;
use crate::config::{AppConfig, ConfigLoader};
use crate::db;
use crate::error::OrchestratorError;
use crate::handlers::jobs::{JobInfo, LogLine};
use crate::handlers::tenants::TenantInfo;
use crate::models::{JobStatus, LogLevel};
use crate::orchestrator::{JobOrchestrator, OrchestratorSettings};
use crate::pipeline::CommandPipeline;
use crate::repositories::{
    JobFilter, JobLedger, LogSink, NewTenantConfig, TenantConfigPatch, TenantConfigRepository,
};
use crate::server::{AppState, run_server};
use crate::telemetry;
use crate::worker::{self, EXIT_FAILURE, EXIT_MISSING_CONFIG, PartialPayload, WorkerEnvironment};

const CLI_ACTOR: &str = "cli";

#[derive(Debug, Parser)]
#[command(
    name = "backfill-orchestrator",
    version,
    about = "Per-merchant historical backfill orchestration"
)]
pub struct Cli {
    /// Directory holding the layered `.env` files
    #[arg(long, global = true, env = "BACKFILL_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the HTTP API
    Serve,
    /// Apply pending database migrations
    Migrate,
    /// Administer merchant configuration
    #[command(subcommand)]
    Tenant(TenantCommand),
    /// Request the historical backfill for a merchant
    Backfill {
        merchant: String,
        /// Recorded as the job's creator
        #[arg(long, default_value = CLI_ACTOR)]
        requested_by: String,
    },
    /// Inspect the job ledger
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Run one backfill attempt from the launch payload in the environment
    Worker,
}

#[derive(Debug, Subcommand)]
pub enum TenantCommand {
    /// List tenants ordered by merchant
    List {
        #[arg(long)]
        active_only: bool,
    },
    /// Show one tenant
    Show { merchant: String },
    /// Onboard a merchant
    Add(AddTenantArgs),
    /// Change a tenant's settings
    Update(UpdateTenantArgs),
    /// Soft-deactivate a tenant
    Deactivate { merchant: String },
    /// Re-activate a tenant
    Activate { merchant: String },
}

#[derive(Debug, Args)]
pub struct AddTenantArgs {
    pub merchant: String,
    #[arg(long)]
    pub credential_ref: String,
    #[arg(long)]
    pub warehouse_project: String,
    #[arg(long)]
    pub warehouse_dataset: String,
    /// First day of history to extract (YYYY-MM-DD)
    #[arg(long)]
    pub backfill_start_date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
pub struct UpdateTenantArgs {
    pub merchant: String,
    #[arg(long)]
    pub credential_ref: Option<String>,
    #[arg(long)]
    pub warehouse_project: Option<String>,
    #[arg(long)]
    pub warehouse_dataset: Option<String>,
    #[arg(long)]
    pub backfill_start_date: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List jobs, newest first
    List {
        #[arg(long)]
        merchant: Option<String>,
        #[arg(long)]
        status: Option<JobStatus>,
        /// Only pending and running jobs
        #[arg(long, conflicts_with = "status")]
        active: bool,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Show one job record
    Show { job_id: Uuid },
    /// Print a job's log in write order
    Logs {
        job_id: Uuid,
        #[arg(long)]
        level: Option<LogLevel>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Summarise a job's errors and warnings
    Errors { job_id: Uuid },
    /// Fail jobs stuck in pending, or with --running, jobs whose worker died
    ReapStale {
        /// Defaults to BACKFILL_STALE_PENDING_HOURS, or the runner's timeout
        /// across all attempts with --running
        #[arg(long)]
        hours: Option<u64>,
        /// Reap `running` jobs instead of `pending` ones
        #[arg(long)]
        running: bool,
    },
}

/// Parse arguments, run the command and return the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match cli.command {
        Commands::Worker => run_worker(cli.config_dir).await,
        command => match dispatch(cli.config_dir, command).await {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!(error = ?err, "Command failed");
                eprintln!("error: {err:#}");
                EXIT_FAILURE
            }
        },
    }
}

fn load_config(config_dir: Option<PathBuf>) -> Result<AppConfig> {
    let loader = match config_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    loader.load().context("loading configuration")
}

async fn bootstrap(config_dir: Option<PathBuf>) -> Result<(AppConfig, DatabaseConnection)> {
    let config = load_config(config_dir)?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    Ok((config, db))
}

async fn dispatch(config_dir: Option<PathBuf>, command: Commands) -> Result<()> {
    let (config, db) = bootstrap(config_dir).await?;

    match command {
        Commands::Serve => serve(config, db).await,
        Commands::Migrate => {
            Migrator::up(&db, None).await.context("applying migrations")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Commands::Tenant(cmd) => tenant(db, cmd).await,
        Commands::Backfill {
            merchant,
            requested_by,
        } => {
            let orchestrator = build_orchestrator(&config, db).await?;
            let handle = orchestrator
                .request_backfill(&merchant, Some(&requested_by))
                .await?;
            print_json(&handle)
        }
        Commands::Jobs(cmd) => jobs(&config, db, cmd).await,
        Commands::Worker => anyhow::bail!("the worker runs through its own entry point"),
    }
}

async fn build_orchestrator(config: &AppConfig, db: DatabaseConnection) -> Result<JobOrchestrator> {
    let backend = backend::from_config(config)
        .await
        .context("configuring execution backend")?;
    tracing::info!(backend = %backend.kind(), "Execution backend selected");
    Ok(JobOrchestrator::new(
        db,
        backend,
        OrchestratorSettings::from_config(config),
    ))
}

async fn serve(config: AppConfig, db: DatabaseConnection) -> Result<()> {
    config
        .validate_for_server()
        .context("validating server configuration")?;
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Loaded configuration");
    }

    let orchestrator = Arc::new(build_orchestrator(&config, db.clone()).await?);
    let config = Arc::new(config);
    let state = AppState {
        config: Arc::clone(&config),
        db,
        orchestrator,
    };
    run_server(config, state).await
}

async fn tenant(db: DatabaseConnection, cmd: TenantCommand) -> Result<()> {
    let repo = TenantConfigRepository::new(db);
    match cmd {
        TenantCommand::List { active_only } => {
            let tenants: Vec<TenantInfo> = repo
                .list(active_only)
                .await?
                .into_iter()
                .map(TenantInfo::from)
                .collect();
            print_json(&tenants)
        }
        TenantCommand::Show { merchant } => {
            let tenant = repo
                .get(&merchant)
                .await?
                .with_context(|| format!("tenant '{merchant}' not found"))?;
            print_json(&TenantInfo::from(tenant))
        }
        TenantCommand::Add(args) => {
            let tenant = repo
                .create(
                    NewTenantConfig {
                        merchant: args.merchant,
                        credential_ref: args.credential_ref,
                        warehouse_project: args.warehouse_project,
                        warehouse_dataset: args.warehouse_dataset,
                        backfill_start_date: args.backfill_start_date,
                        metadata: None,
                    },
                    Some(CLI_ACTOR),
                )
                .await?;
            print_json(&TenantInfo::from(tenant))
        }
        TenantCommand::Update(args) => {
            let patch = TenantConfigPatch {
                credential_ref: args.credential_ref,
                warehouse_project: args.warehouse_project,
                warehouse_dataset: args.warehouse_dataset,
                backfill_start_date: args.backfill_start_date,
                metadata: None,
            };
            let tenant = repo.update(&args.merchant, patch, Some(CLI_ACTOR)).await?;
            print_json(&TenantInfo::from(tenant))
        }
        TenantCommand::Deactivate { merchant } => {
            let tenant = repo.deactivate(&merchant, Some(CLI_ACTOR)).await?;
            print_json(&TenantInfo::from(tenant))
        }
        TenantCommand::Activate { merchant } => {
            let tenant = repo.activate(&merchant, Some(CLI_ACTOR)).await?;
            print_json(&TenantInfo::from(tenant))
        }
    }
}

async fn jobs(config: &AppConfig, db: DatabaseConnection, cmd: JobsCommand) -> Result<()> {
    let ledger = JobLedger::new(db.clone());
    match cmd {
        JobsCommand::List {
            merchant,
            status,
            active,
            limit,
        } => {
            let records = if active {
                ledger.active().await?
            } else {
                ledger
                    .list(JobFilter {
                        merchant,
                        status,
                        limit: Some(limit),
                    })
                    .await?
            };
            let jobs: Vec<JobInfo> = records.into_iter().map(JobInfo::from).collect();
            print_json(&jobs)
        }
        JobsCommand::Show { job_id } => print_json(&JobInfo::from(ledger.get(job_id).await?)),
        JobsCommand::Logs {
            job_id,
            level,
            limit,
        } => {
            ledger.get(job_id).await?;
            for line in LogSink::new(db).for_job(job_id, level, limit).await? {
                let line = LogLine::from(line);
                println!(
                    "{} [{}] {}: {}",
                    line.timestamp,
                    line.level,
                    line.component.as_deref().unwrap_or("-"),
                    line.message
                );
            }
            Ok(())
        }
        JobsCommand::Errors { job_id } => {
            ledger.get(job_id).await?;
            print_json(&LogSink::new(db).error_summary(job_id).await?)
        }
        JobsCommand::ReapStale { hours, running } => {
            let hours = match (hours, running) {
                (Some(hours), _) => hours,
                (None, false) => config.stale_pending_hours,
                (None, true) => running_timeout_hours(&config),
            };
            let older_than =
                chrono::Duration::hours(i64::try_from(hours).context("hours out of range")?);
            let orchestrator = build_orchestrator(config, db).await?;
            let reaped = if running {
                orchestrator.reap_stale_running(older_than).await?
            } else {
                orchestrator.reap_stale_pending(older_than).await?
            };
            let failed: Vec<JobInfo> = reaped.into_iter().map(JobInfo::from).collect();
            print_json(&failed)
        }
    }
}

/// Longest a worker can legitimately stay `running`: every attempt hitting the
/// task timeout, rounded up to whole hours.
fn running_timeout_hours(config: &AppConfig) -> u64 {
    let attempts = u64::from(config.runner.max_retries) + 1;
    (config.runner.timeout_seconds * attempts).div_ceil(3600)
}

/// Worker entry point. The exit code is what the backend's retry policy sees.
async fn run_worker(config_dir: Option<PathBuf>) -> i32 {
    let env = WorkerEnvironment::from_env();

    let (config, db) = match bootstrap(config_dir).await {
        Ok(ready) => ready,
        Err(err) => {
            eprintln!("error: {err:#}");
            return match env {
                Ok(_) => EXIT_FAILURE,
                Err(_) => EXIT_MISSING_CONFIG,
            };
        }
    };

    let env = match env {
        Ok(env) => env,
        Err(err) => {
            tracing::error!(error = %err, "Launch payload could not be decoded");
            if let Some(partial) = PartialPayload::from_vars(|name| std::env::var(name).ok())
                && let Err(record_err) = worker::record_missing_config(&db, partial, &err).await
            {
                tracing::error!(error = %record_err, "Failed to record payload error on the job");
            }
            return EXIT_MISSING_CONFIG;
        }
    };

    let pipeline = CommandPipeline::new(config.pipeline_command.clone().unwrap_or_default());
    match worker::run(&db, &env, &pipeline).await {
        Ok(outcome) => {
            tracing::info!(?outcome, "Worker finished");
            outcome.exit_code()
        }
        Err(err @ OrchestratorError::MissingConfig { .. }) => {
            tracing::error!(error = %err, "Launch payload does not match the job record");
            EXIT_MISSING_CONFIG
        }
        Err(err) => {
            tracing::error!(error = %err, kind = err.kind(), "Worker failed");
            EXIT_FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_backfill_with_actor() {
        let cli = Cli::try_parse_from([
            "backfill-orchestrator",
            "backfill",
            "acme.myshopify.com",
            "--requested-by",
            "ops",
        ])
        .expect("parses");

        match cli.command {
            Commands::Backfill {
                merchant,
                requested_by,
            } => {
                assert_eq!(merchant, "acme.myshopify.com");
                assert_eq!(requested_by, "ops");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn running_reap_window_covers_every_attempt() {
        let mut config = AppConfig::default();
        assert_eq!(running_timeout_hours(&config), 80);

        config.runner.timeout_seconds = 1800;
        config.runner.max_retries = 0;
        assert_eq!(running_timeout_hours(&config), 1);

        config.runner.max_retries = 2;
        assert_eq!(running_timeout_hours(&config), 2);
    }

    #[test]
    fn parses_reap_stale_running() {
        let cli = Cli::try_parse_from(["backfill-orchestrator", "jobs", "reap-stale", "--running"])
            .expect("parses");

        match cli.command {
            Commands::Jobs(JobsCommand::ReapStale { hours, running }) => {
                assert_eq!(hours, None);
                assert!(running);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_job_filters() {
        let cli = Cli::try_parse_from([
            "backfill-orchestrator",
            "jobs",
            "list",
            "--status",
            "failed",
            "--limit",
            "5",
        ])
        .expect("parses");

        match cli.command {
            Commands::Jobs(JobsCommand::List { status, limit, .. }) => {
                assert_eq!(status, Some(JobStatus::Failed));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn active_conflicts_with_status() {
        let result = Cli::try_parse_from([
            "backfill-orchestrator",
            "jobs",
            "list",
            "--active",
            "--status",
            "running",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn tenant_add_requires_warehouse_settings() {
        let result = Cli::try_parse_from([
            "backfill-orchestrator",
            "tenant",
            "add",
            "acme.myshopify.com",
            "--credential-ref",
            "projects/acme/secrets/token",
        ]);
        assert!(result.is_err());
    }
}
