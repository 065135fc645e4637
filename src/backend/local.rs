//! Local process backend for development.
//!
//! Runs the worker as a child process of this binary (`<program> worker`) with
//! the launch payload in its environment, and waits for it. There is no unit
//! namespace to manage and no automatic retry.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    BackendError, BackendKind, ExecutionBackend, ExecutionHandle, ExecutionOutcome, LaunchPayload,
    UnitRef, UnitSpec,
};
use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl LocalProcessBackend {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Uses `LOCAL_WORKER_PROGRAM` when configured, else the running binary.
    pub fn from_config(config: &AppConfig) -> Result<Self, BackendError> {
        let program = match &config.local_worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                BackendError::Configuration(format!("Failed to resolve current executable: {e}"))
            })?,
        };
        Ok(Self::new(program, vec!["worker".to_string()]))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn retry_budget(&self) -> u32 {
        0
    }

    async fn ensure_unit(&self, spec: &UnitSpec) -> Result<UnitRef, BackendError> {
        Ok(UnitRef {
            name: spec.name.clone(),
            created: false,
        })
    }

    async fn launch(
        &self,
        unit: &UnitRef,
        payload: &LaunchPayload,
    ) -> Result<ExecutionHandle, BackendError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(payload.env_vars())
            .stdin(Stdio::null())
            .kill_on_drop(false);

        tracing::info!(
            unit_name = %unit.name,
            program = %self.program.display(),
            "Running worker as local child process"
        );

        let status = command.status().await.map_err(|e| {
            BackendError::LaunchFailed(format!(
                "Failed to run worker process {}: {e}",
                self.program.display()
            ))
        })?;

        // Killed by a signal: no exit code.
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            tracing::warn!(unit_name = %unit.name, exit_code, "Local worker exited with failure");
        }

        Ok(ExecutionHandle {
            unit_name: unit.name.clone(),
            execution_name: None,
            outcome: ExecutionOutcome::Completed { exit_code },
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{ResourceLimits, TenantSnapshot};

    fn payload() -> LaunchPayload {
        let tenant = TenantSnapshot {
            merchant: "a.myshopify.com".into(),
            credential_ref: "secret-ref".into(),
            warehouse_project: "proj".into(),
            warehouse_dataset: "shopify_a".into(),
            backfill_start_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        LaunchPayload::new(uuid::Uuid::new_v4(), &tenant, 0).unwrap()
    }

    async fn run(script: &str) -> ExecutionHandle {
        let backend = LocalProcessBackend::new("/bin/sh".into(), vec!["-c".into(), script.into()]);
        let unit = backend
            .ensure_unit(&UnitSpec {
                name: "shopify-a".into(),
                merchant: "a.myshopify.com".into(),
                limits: ResourceLimits::default(),
            })
            .await
            .unwrap();
        backend.launch(&unit, &payload()).await.unwrap()
    }

    #[tokio::test]
    async fn child_sees_payload_and_exit_code_is_reported() {
        let handle = run(r#"test "$MERCHANT_IDENTITY" = "a.myshopify.com" && exit 0; exit 9"#).await;
        assert_eq!(handle.outcome, ExecutionOutcome::Completed { exit_code: 0 });

        let handle = run("exit 3").await;
        assert_eq!(handle.outcome, ExecutionOutcome::Completed { exit_code: 3 });
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let backend = LocalProcessBackend::new("/nonexistent/worker".into(), vec![]);
        let unit = UnitRef {
            name: "shopify-a".into(),
            created: false,
        };
        assert!(matches!(
            backend.launch(&unit, &payload()).await,
            Err(BackendError::LaunchFailed(_))
        ));
    }
}
