//! Cloud Run Jobs execution backend.
//!
//! Each merchant owns one Cloud Run job named after it. The owning merchant is
//! recorded as a job annotation so a later `ensure_unit` can tell a reusable
//! unit from a name held by another tenant. Executions are started with the
//! launch payload as container env overrides and are never awaited.
//!
//! ## Authentication
//!
//! Uses `RunnerConfig::access_token` when set, otherwise asks the instance
//! metadata server for the default service account's token.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{
    BackendError, BackendKind, ExecutionBackend, ExecutionHandle, ExecutionOutcome, LaunchPayload,
    UnitRef, UnitSpec,
};
use crate::config::RunnerConfig;

/// Annotation holding the merchant a job was created for.
pub const OWNER_ANNOTATION: &str = "backfill.orchestrator/merchant";

/// Largest env payload accepted by a single execution override.
pub const MAX_PAYLOAD_BYTES: usize = 32 * 1024;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template: Option<ExecutionTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionTemplate {
    parallelism: u32,
    task_count: u32,
    template: TaskTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskTemplate {
    containers: Vec<Container>,
    timeout: String,
    max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Container {
    image: String,
    resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Resources {
    limits: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunJobRequest {
    overrides: Overrides,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Overrides {
    container_overrides: Vec<ContainerOverride>,
    task_count: u32,
}

#[derive(Debug, Serialize)]
struct ContainerOverride {
    env: Vec<EnvVar>,
}

#[derive(Debug, Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    #[serde(default)]
    name: Option<String>,
}

/// Cloud Run API error response.
#[derive(Debug, Deserialize)]
struct CloudRunErrorResponse {
    error: CloudRunError,
}

#[derive(Debug, Deserialize)]
struct CloudRunError {
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

/// Isolated runner backed by the Cloud Run Admin API v2.
#[derive(Clone)]
pub struct CloudRunBackend {
    config: RunnerConfig,
    project_id: String,
    image: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for CloudRunBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudRunBackend")
            .field("project_id", &self.project_id)
            .field("region", &self.config.region)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl CloudRunBackend {
    /// Creates a new Cloud Run backend.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the project or image is missing or the HTTP
    /// client cannot be built.
    pub fn new(config: RunnerConfig) -> Result<Self, BackendError> {
        let project_id = config
            .project_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| BackendError::Configuration("runner project id is not set".into()))?;
        let image = config
            .image
            .clone()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| BackendError::Configuration("runner image is not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            project_id,
            image,
            client,
        })
    }

    fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}",
            self.project_id, self.config.region
        )
    }

    fn job_path(&self, name: &str) -> String {
        format!("{}/jobs/{}", self.parent(), name)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v2/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, String> {
        if let Some(token) = self.config.access_token.as_deref() {
            return Ok(token.to_string());
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| format!("Failed to get GCP access token: {e}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "Failed to get GCP access token: metadata server returned {}",
                response.status()
            ));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse metadata token: {e}"))?;
        Ok(token.access_token)
    }

    /// Formats a duration as a Cloud Run API duration string.
    pub(crate) fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        let nanos = duration.subsec_nanos();
        if nanos == 0 {
            return format!("{secs}s");
        }

        let mut fractional = format!("{nanos:09}");
        while fractional.ends_with('0') {
            fractional.pop();
        }

        format!("{secs}.{fractional}s")
    }

    async fn api_error(response: reqwest::Response) -> String {
        let status = response.status();
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());

        if let Ok(error_response) = serde_json::from_str::<CloudRunErrorResponse>(&error_body) {
            format!(
                "Cloud Run API error: {} ({})",
                error_response.error.message, error_response.error.status
            )
        } else {
            format!("Cloud Run API error: {} - {}", status, error_body)
        }
    }

    fn job_body(&self, spec: &UnitSpec) -> Job {
        let mut limits = BTreeMap::new();
        limits.insert("memory".to_string(), spec.limits.memory.clone());
        limits.insert("cpu".to_string(), spec.limits.cpu.clone());

        let mut labels = BTreeMap::new();
        labels.insert("managed-by".to_string(), "backfill-orchestrator".to_string());
        labels.insert("pipeline-type".to_string(), "historical".to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(OWNER_ANNOTATION.to_string(), spec.merchant.clone());

        Job {
            name: None,
            labels,
            annotations,
            template: Some(ExecutionTemplate {
                parallelism: 1,
                task_count: 1,
                template: TaskTemplate {
                    containers: vec![Container {
                        image: self.image.clone(),
                        resources: Resources { limits },
                    }],
                    timeout: Self::format_duration(spec.limits.timeout),
                    max_retries: spec.limits.max_retries,
                    service_account: self.config.service_account.clone(),
                },
            }),
        }
    }

    async fn get_job(&self, name: &str, token: &str) -> Result<Option<Job>, BackendError> {
        let response = self
            .client
            .get(self.api_url(&self.job_path(name)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                BackendError::UnitCreationFailed(format!("Cloud Run API request failed: {e}"))
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json().await.map(Some).map_err(|e| {
                BackendError::UnitCreationFailed(format!("Failed to parse job resource: {e}"))
            }),
            _ => Err(BackendError::UnitCreationFailed(
                Self::api_error(response).await,
            )),
        }
    }

    fn claim_existing(spec: &UnitSpec, job: &Job) -> Result<UnitRef, BackendError> {
        match job.annotations.get(OWNER_ANNOTATION) {
            Some(owner) if owner == &spec.merchant => Ok(UnitRef {
                name: spec.name.clone(),
                created: false,
            }),
            owner => Err(BackendError::NameCollision {
                name: spec.name.clone(),
                owner: owner.cloned().unwrap_or_else(|| "unmanaged".to_string()),
            }),
        }
    }
}

#[async_trait]
impl ExecutionBackend for CloudRunBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Isolated
    }

    fn retry_budget(&self) -> u32 {
        self.config.max_retries
    }

    async fn ensure_unit(&self, spec: &UnitSpec) -> Result<UnitRef, BackendError> {
        let token = self
            .access_token()
            .await
            .map_err(BackendError::UnitCreationFailed)?;

        if let Some(existing) = self.get_job(&spec.name, &token).await? {
            return Self::claim_existing(spec, &existing);
        }

        let url = format!(
            "{}?jobId={}",
            self.api_url(&format!("{}/jobs", self.parent())),
            spec.name
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&self.job_body(spec))
            .send()
            .await
            .map_err(|e| {
                BackendError::UnitCreationFailed(format!("Cloud Run API request failed: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(unit_name = %spec.name, merchant = %spec.merchant, "Created Cloud Run job");
            return Ok(UnitRef {
                name: spec.name.clone(),
                created: true,
            });
        }

        if status == StatusCode::CONFLICT {
            // Created concurrently; decide on whoever won.
            return match self.get_job(&spec.name, &token).await? {
                Some(job) => Self::claim_existing(spec, &job),
                None => Err(BackendError::UnitCreationFailed(format!(
                    "job '{}' reported as existing but could not be read",
                    spec.name
                ))),
            };
        }

        Err(BackendError::UnitCreationFailed(
            Self::api_error(response).await,
        ))
    }

    async fn launch(
        &self,
        unit: &UnitRef,
        payload: &LaunchPayload,
    ) -> Result<ExecutionHandle, BackendError> {
        if payload.encoded_len() > MAX_PAYLOAD_BYTES {
            return Err(BackendError::LaunchFailed(format!(
                "launch payload is {} bytes, limit is {MAX_PAYLOAD_BYTES}",
                payload.encoded_len()
            )));
        }

        let token = self
            .access_token()
            .await
            .map_err(BackendError::LaunchFailed)?;

        let env = payload
            .env_vars()
            .into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect();
        let request = RunJobRequest {
            overrides: Overrides {
                container_overrides: vec![ContainerOverride { env }],
                task_count: 1,
            },
        };

        let url = format!("{}:run", self.api_url(&self.job_path(&unit.name)));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::LaunchFailed(format!("Cloud Run API request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::LaunchFailed(format!(
                "execution unit '{}' does not exist",
                unit.name
            )));
        }
        if !status.is_success() {
            return Err(BackendError::LaunchFailed(Self::api_error(response).await));
        }

        let operation: Operation = response
            .json()
            .await
            .map_err(|e| BackendError::LaunchFailed(format!("Failed to parse run response: {e}")))?;
        let execution_name = operation
            .metadata
            .and_then(|metadata| metadata.name)
            .unwrap_or(operation.name);

        tracing::info!(
            unit_name = %unit.name,
            execution = %execution_name,
            "Started Cloud Run execution"
        );

        Ok(ExecutionHandle {
            unit_name: unit.name.clone(),
            execution_name: Some(execution_name),
            outcome: ExecutionOutcome::Detached,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> RunnerConfig {
        RunnerConfig {
            project_id: Some("proj".into()),
            image: Some("gcr.io/proj/backfill:latest".into()),
            access_token: Some("token".into()),
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn format_duration_seconds_only() {
        assert_eq!(
            CloudRunBackend::format_duration(Duration::from_secs(72_000)),
            "72000s"
        );
    }

    #[test]
    fn format_duration_subsecond() {
        assert_eq!(
            CloudRunBackend::format_duration(Duration::from_millis(1500)),
            "1.5s"
        );
    }

    #[test]
    fn missing_image_is_a_configuration_error() {
        let config = RunnerConfig {
            image: None,
            ..runner()
        };
        assert!(matches!(
            CloudRunBackend::new(config),
            Err(BackendError::Configuration(_))
        ));
    }

    #[test]
    fn job_body_carries_limits_and_owner() {
        let backend = CloudRunBackend::new(runner()).unwrap();
        let spec = UnitSpec {
            name: "shopify-acme".into(),
            merchant: "acme.myshopify.com".into(),
            limits: Default::default(),
        };
        let body = serde_json::to_value(backend.job_body(&spec)).unwrap();

        assert_eq!(body["annotations"][OWNER_ANNOTATION], "acme.myshopify.com");
        let task = &body["template"]["template"];
        assert_eq!(task["timeout"], "72000s");
        assert_eq!(task["maxRetries"], 3);
        assert_eq!(task["containers"][0]["resources"]["limits"]["memory"], "8Gi");
        assert_eq!(body["template"]["parallelism"], 1);
    }

    #[test]
    fn existing_job_without_owner_is_a_collision() {
        let spec = UnitSpec {
            name: "shopify-acme".into(),
            merchant: "acme.myshopify.com".into(),
            limits: Default::default(),
        };
        let err = CloudRunBackend::claim_existing(&spec, &Job::default()).unwrap_err();
        assert!(matches!(err, BackendError::NameCollision { owner, .. } if owner == "unmanaged"));
    }
}
