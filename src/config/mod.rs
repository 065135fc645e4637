//! Configuration loading for the backfill orchestrator.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `BACKFILL_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, fmt, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "BACKFILL_";

/// Environment variable set by the managed container platform inside every
/// service or job instance. Its presence selects the isolated runner.
pub const ISOLATED_ENV_SIGNAL: &str = "K_SERVICE";

/// Which execution backend the process should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendSelection {
    /// Decide from [`ISOLATED_ENV_SIGNAL`] at startup.
    #[default]
    Auto,
    Isolated,
    Local,
}

impl FromStr for BackendSelection {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "isolated" | "cloud_run" | "cloud-run" => Ok(Self::Isolated),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::InvalidExecutionBackend {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BackendSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Auto => "auto",
            Self::Isolated => "isolated",
            Self::Local => "local",
        };
        f.write_str(label)
    }
}

/// Application configuration derived from `BACKFILL_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default)]
    pub execution_backend: BackendSelection,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Program the local runner spawns; defaults to the current executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_worker_program: Option<PathBuf>,
    /// Extraction command the worker runs, e.g. `python -m historical.run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_command: Option<String>,
    #[serde(default = "default_max_unit_name_versions")]
    pub max_unit_name_versions: u32,
    #[serde(default = "default_stale_pending_hours")]
    pub stale_pending_hours: u64,
}

/// Settings for the isolated job runner (Cloud Run Jobs Admin API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RunnerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_runner_region")]
    pub region: String,
    /// Container image every execution unit runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default = "default_runner_memory")]
    pub memory: String,
    #[serde(default = "default_runner_cpu")]
    pub cpu: String,
    #[serde(default = "default_runner_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Automatic re-executions on non-zero exit, owned by the platform.
    #[serde(default = "default_runner_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_runner_api_base")]
    pub api_base: String,
    /// Static bearer token; when unset the metadata server is queried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            region: default_runner_region(),
            image: None,
            service_account: None,
            memory: default_runner_memory(),
            cpu: default_runner_cpu(),
            timeout_seconds: default_runner_timeout_seconds(),
            max_retries: default_runner_max_retries(),
            api_base: default_runner_api_base(),
            access_token: None,
        }
    }
}

impl RunnerConfig {
    /// Validates isolated runner settings. Only called when that backend is selected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingRunnerSetting {
                key: "RUNNER_PROJECT_ID",
            });
        }
        if self.image.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingRunnerSetting {
                key: "RUNNER_IMAGE",
            });
        }
        if self.region.trim().is_empty() {
            return Err(ConfigError::MissingRunnerSetting {
                key: "RUNNER_REGION",
            });
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::InvalidRunnerTimeout {
                value: self.timeout_seconds,
            });
        }
        if self.max_retries > 10 {
            return Err(ConfigError::InvalidRunnerRetries {
                value: self.max_retries,
            });
        }
        url::Url::parse(&self.api_base).map_err(|source| ConfigError::InvalidRunnerApiBase {
            value: self.api_base.clone(),
            source,
        })?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            execution_backend: BackendSelection::default(),
            runner: RunnerConfig::default(),
            local_worker_program: None,
            pipeline_command: None,
            max_unit_name_versions: default_max_unit_name_versions(),
            stale_pending_hours: default_stale_pending_hours(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.runner.access_token.is_some() {
            config.runner.access_token = Some("[REDACTED]".to_string());
        }
        if let Ok(mut parsed) = url::Url::parse(&config.database_url)
            && parsed.password().is_some()
            && parsed.set_password(Some("REDACTED")).is_ok()
        {
            config.database_url = parsed.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates settings every command depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }
        if self.max_unit_name_versions == 0 || self.max_unit_name_versions > 100 {
            return Err(ConfigError::InvalidUnitNameVersions {
                value: self.max_unit_name_versions,
            });
        }
        if self.stale_pending_hours == 0 {
            return Err(ConfigError::InvalidStalePendingHours {
                value: self.stale_pending_hours,
            });
        }
        Ok(())
    }

    /// Validates settings only the HTTP API needs.
    pub fn validate_for_server(&self) -> Result<(), ConfigError> {
        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }
        self.bind_addr()
            .map(|_| ())
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: self.api_bind_addr.clone(),
                source,
            })
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://postgres@localhost:5432/backfill".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_runner_region() -> String {
    "us-central1".to_string()
}

fn default_runner_memory() -> String {
    "8Gi".to_string()
}

fn default_runner_cpu() -> String {
    "2".to_string()
}

fn default_runner_timeout_seconds() -> u64 {
    72_000 // 20 hours
}

fn default_runner_max_retries() -> u32 {
    3
}

fn default_runner_api_base() -> String {
    "https://run.googleapis.com".to_string()
}

fn default_max_unit_name_versions() -> u32 {
    20
}

fn default_stale_pending_hours() -> u64 {
    1
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set BACKFILL_OPERATOR_TOKEN or BACKFILL_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("database url is missing; set BACKFILL_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("execution backend must be one of auto, isolated, local; got '{value}'")]
    InvalidExecutionBackend { value: String },
    #[error("isolated runner requires BACKFILL_{key}")]
    MissingRunnerSetting { key: &'static str },
    #[error("runner timeout must be positive, got {value}")]
    InvalidRunnerTimeout { value: u64 },
    #[error("runner max retries must be between 0 and 10, got {value}")]
    InvalidRunnerRetries { value: u32 },
    #[error("invalid runner api base '{value}': {source}")]
    InvalidRunnerApiBase {
        value: String,
        source: url::ParseError,
    },
    #[error("max unit name versions must be between 1 and 100, got {value}")]
    InvalidUnitNameVersions { value: u32 },
    #[error("stale pending threshold must be at least one hour, got {value}")]
    InvalidStalePendingHours { value: u64 },
}

/// Loads configuration using layered `.env` files and `BACKFILL_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Files are layered as `.env`,
    /// `.env.local`, `.env.<profile>`, `.env.<profile>.local`, with the process
    /// environment applied last.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let config = Self::from_layered(layered, profile_hint)?;
        config.validate()?;
        Ok(config)
    }

    fn from_layered(
        mut layered: BTreeMap<String, String>,
        profile_hint: String,
    ) -> Result<AppConfig, ConfigError> {
        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Comma-separated list wins over the single-token form
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN") {
            split_list(&token)
        } else {
            Vec::new()
        };

        let execution_backend = layered
            .remove("EXECUTION_BACKEND")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        let runner = RunnerConfig {
            project_id: non_empty(layered.remove("RUNNER_PROJECT_ID")),
            region: layered
                .remove("RUNNER_REGION")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_runner_region),
            image: non_empty(layered.remove("RUNNER_IMAGE")),
            service_account: non_empty(layered.remove("RUNNER_SERVICE_ACCOUNT")),
            memory: layered
                .remove("RUNNER_MEMORY")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_runner_memory),
            cpu: layered
                .remove("RUNNER_CPU")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_runner_cpu),
            timeout_seconds: layered
                .remove("RUNNER_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_runner_timeout_seconds),
            max_retries: layered
                .remove("RUNNER_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_runner_max_retries),
            api_base: layered
                .remove("RUNNER_API_BASE")
                .filter(|v| !v.is_empty())
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(default_runner_api_base),
            access_token: non_empty(layered.remove("RUNNER_ACCESS_TOKEN")),
        };

        let local_worker_program = non_empty(layered.remove("LOCAL_WORKER_PROGRAM")).map(PathBuf::from);
        let pipeline_command = non_empty(layered.remove("PIPELINE_COMMAND"));
        let max_unit_name_versions = layered
            .remove("MAX_UNIT_NAME_VERSIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_max_unit_name_versions);
        let stale_pending_hours = layered
            .remove("STALE_PENDING_HOURS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_stale_pending_hours);

        Ok(AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            execution_backend,
            runner,
            local_worker_program,
            pipeline_command,
            max_unit_name_versions,
            stale_pending_hours,
        })
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
