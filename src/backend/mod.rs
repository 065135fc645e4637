//! Execution backend abstraction.
//!
//! This module provides:
//!
//! - [`ExecutionBackend`]: trait for creating execution units and launching runs
//! - [`LaunchPayload`]: the flat string mapping handed to a worker
//! - [`CloudRunBackend`], [`LocalProcessBackend`] and [`InMemoryBackend`]
//!
//! A backend is chosen once per process by [`from_config`] and shared behind an
//! `Arc<dyn ExecutionBackend>`; nothing downstream inspects the environment.

pub mod cloud_run;
pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AppConfig, BackendSelection, ISOLATED_ENV_SIGNAL};
use crate::models::tenant_config;

pub use cloud_run::CloudRunBackend;
pub use local::LocalProcessBackend;
pub use memory::InMemoryBackend;

/// Payload keys. Each is exported to the worker as its uppercased form.
pub const KEY_JOB_ID: &str = "job_id";
pub const KEY_MERCHANT_IDENTITY: &str = "merchant_identity";
pub const KEY_TENANT_CONFIG: &str = "tenant_config";
pub const KEY_MAX_RETRIES: &str = "max_retries";

/// Which variant a backend is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Isolated,
    Local,
}

impl BackendKind {
    /// Resolve the configured selection against the platform signal.
    pub fn detect(selection: BackendSelection, signal_present: bool) -> Self {
        match selection {
            BackendSelection::Isolated => Self::Isolated,
            BackendSelection::Local => Self::Local,
            BackendSelection::Auto if signal_present => Self::Isolated,
            BackendSelection::Auto => Self::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource envelope applied when a unit is first created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory: String,
    pub cpu: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl ResourceLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            memory: config.runner.memory.clone(),
            cpu: config.runner.cpu.clone(),
            timeout: Duration::from_secs(config.runner.timeout_seconds),
            max_retries: config.runner.max_retries,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "8Gi".to_string(),
            cpu: "2".to_string(),
            timeout: Duration::from_secs(72_000),
            max_retries: 3,
        }
    }
}

/// What the orchestrator asks a backend to create or reuse.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    /// Logical tenant the unit belongs to; used to detect foreign owners.
    pub merchant: String,
    pub limits: ResourceLimits,
}

/// Reference to an existing execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRef {
    pub name: String,
    /// True when this call created the unit.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Run continues out of process; status arrives via the ledger.
    Detached,
    /// Run finished before `launch` returned.
    Completed { exit_code: i32 },
}

/// Returned by [`ExecutionBackend::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub unit_name: String,
    pub execution_name: Option<String>,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// The name is bound to a unit that belongs to another tenant.
    #[error("execution unit '{name}' already belongs to '{owner}'")]
    NameCollision { name: String, owner: String },
    #[error("{0}")]
    UnitCreationFailed(String),
    #[error("{0}")]
    LaunchFailed(String),
    #[error("execution backend misconfigured: {0}")]
    Configuration(String),
}

/// The subset of tenant configuration a worker needs.
///
/// Carries the credential reference, never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSnapshot {
    pub merchant: String,
    pub credential_ref: String,
    pub warehouse_project: String,
    pub warehouse_dataset: String,
    pub backfill_start_date: chrono::NaiveDate,
}

impl From<&tenant_config::Model> for TenantSnapshot {
    fn from(tenant: &tenant_config::Model) -> Self {
        Self {
            merchant: tenant.merchant.clone(),
            credential_ref: tenant.credential_ref.clone(),
            warehouse_project: tenant.warehouse_project.clone(),
            warehouse_dataset: tenant.warehouse_dataset.clone(),
            backfill_start_date: tenant.backfill_start_date,
        }
    }
}

/// Flat string mapping passed to a launched worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchPayload(BTreeMap<String, String>);

impl LaunchPayload {
    pub fn new(
        job_id: Uuid,
        tenant: &TenantSnapshot,
        max_retries: u32,
    ) -> Result<Self, serde_json::Error> {
        let mut values = BTreeMap::new();
        values.insert(KEY_JOB_ID.to_string(), job_id.to_string());
        values.insert(KEY_MERCHANT_IDENTITY.to_string(), tenant.merchant.clone());
        values.insert(KEY_TENANT_CONFIG.to_string(), serde_json::to_string(tenant)?);
        values.insert(KEY_MAX_RETRIES.to_string(), max_retries.to_string());
        Ok(Self(values))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `(NAME, value)` pairs as exported to the worker's environment.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(key, value)| (env_key(key), value.clone()))
            .collect()
    }

    /// Total bytes of keys and values.
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// Environment variable name for a payload key.
pub fn env_key(key: &str) -> String {
    key.to_ascii_uppercase()
}

/// Execution backend for backfill runs.
///
/// Implementations may target:
/// - Cloud Run Jobs (isolated, fire-and-forget)
/// - A child process of the current binary (local, blocking)
/// - An in-memory fake (tests)
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Automatic re-executions the backend performs on a non-zero exit.
    fn retry_budget(&self) -> u32;

    /// Create the unit or return the existing one unchanged.
    ///
    /// Fails with [`BackendError::NameCollision`] when the name is taken by a
    /// unit for a different merchant.
    async fn ensure_unit(&self, spec: &UnitSpec) -> Result<UnitRef, BackendError>;

    /// Start one execution of `unit` with `payload` in its environment.
    async fn launch(
        &self,
        unit: &UnitRef,
        payload: &LaunchPayload,
    ) -> Result<ExecutionHandle, BackendError>;
}

/// Build the backend for this process. Called once at startup.
pub async fn from_config(config: &AppConfig) -> Result<Arc<dyn ExecutionBackend>, BackendError> {
    let signal_present = std::env::var_os(ISOLATED_ENV_SIGNAL).is_some();
    let kind = BackendKind::detect(config.execution_backend, signal_present);
    tracing::info!(
        backend = %kind,
        selection = %config.execution_backend,
        signal_present,
        "Selected execution backend"
    );

    match kind {
        BackendKind::Isolated => {
            config
                .runner
                .validate()
                .map_err(|err| BackendError::Configuration(err.to_string()))?;
            Ok(Arc::new(CloudRunBackend::new(config.runner.clone())?))
        }
        BackendKind::Local => Ok(Arc::new(LocalProcessBackend::from_config(config)?)),
    }
}
