//! In-memory execution backend for testing.
//!
//! Keeps a unit namespace (`name -> owning merchant`) and a record of every
//! launch. Failures can be injected for either call.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing runs, nothing persists
//! - **Single-process only**

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{
    BackendError, BackendKind, ExecutionBackend, ExecutionHandle, ExecutionOutcome, LaunchPayload,
    UnitRef, UnitSpec,
};

/// A launch the backend accepted.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub unit_name: String,
    pub payload: LaunchPayload,
}

#[derive(Debug, Default)]
struct BackendState {
    units: HashMap<String, String>,
    launches: Vec<LaunchRecord>,
    ensure_failure: Option<String>,
    launch_failure: Option<String>,
}

#[derive(Debug)]
pub struct InMemoryBackend {
    kind: BackendKind,
    retry_budget: u32,
    /// `Some` makes launches complete inline with this exit code.
    completion: Option<i32>,
    state: RwLock<BackendState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::isolated(3)
    }
}

fn poison_err<T>(_: PoisonError<T>) -> BackendError {
    BackendError::Configuration("in-memory backend lock poisoned".to_string())
}

impl InMemoryBackend {
    /// Detached launches, like the isolated runner.
    pub fn isolated(retry_budget: u32) -> Self {
        Self {
            kind: BackendKind::Isolated,
            retry_budget,
            completion: None,
            state: RwLock::new(BackendState::default()),
        }
    }

    /// Blocking launches that report `exit_code`, like the local runner.
    pub fn completing_with(exit_code: i32) -> Self {
        Self {
            kind: BackendKind::Local,
            retry_budget: 0,
            completion: Some(exit_code),
            state: RwLock::new(BackendState::default()),
        }
    }

    /// Bind `name` to another merchant, as if created outside this tenant.
    pub fn register_foreign_unit(
        &self,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.units.insert(name.into(), owner.into());
        Ok(())
    }

    pub fn fail_ensure_with(&self, message: impl Into<String>) -> Result<(), BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.ensure_failure = Some(message.into());
        Ok(())
    }

    pub fn fail_launch_with(&self, message: impl Into<String>) -> Result<(), BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.launch_failure = Some(message.into());
        Ok(())
    }

    pub fn unit_owner(&self, name: &str) -> Result<Option<String>, BackendError> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.units.get(name).cloned())
    }

    pub fn unit_count(&self) -> Result<usize, BackendError> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.units.len())
    }

    pub fn launches(&self) -> Result<Vec<LaunchRecord>, BackendError> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.launches.clone())
    }
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    async fn ensure_unit(&self, spec: &UnitSpec) -> Result<UnitRef, BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(message) = &state.ensure_failure {
            return Err(BackendError::UnitCreationFailed(message.clone()));
        }

        match state.units.get(&spec.name) {
            Some(owner) if owner == &spec.merchant => Ok(UnitRef {
                name: spec.name.clone(),
                created: false,
            }),
            Some(owner) => Err(BackendError::NameCollision {
                name: spec.name.clone(),
                owner: owner.clone(),
            }),
            None => {
                state
                    .units
                    .insert(spec.name.clone(), spec.merchant.clone());
                Ok(UnitRef {
                    name: spec.name.clone(),
                    created: true,
                })
            }
        }
    }

    async fn launch(
        &self,
        unit: &UnitRef,
        payload: &LaunchPayload,
    ) -> Result<ExecutionHandle, BackendError> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(message) = &state.launch_failure {
            return Err(BackendError::LaunchFailed(message.clone()));
        }
        if !state.units.contains_key(&unit.name) && self.kind == BackendKind::Isolated {
            return Err(BackendError::LaunchFailed(format!(
                "execution unit '{}' does not exist",
                unit.name
            )));
        }

        let sequence = state.launches.len() + 1;
        state.launches.push(LaunchRecord {
            unit_name: unit.name.clone(),
            payload: payload.clone(),
        });
        drop(state);

        let outcome = match self.completion {
            Some(exit_code) => ExecutionOutcome::Completed { exit_code },
            None => ExecutionOutcome::Detached,
        };
        Ok(ExecutionHandle {
            unit_name: unit.name.clone(),
            execution_name: Some(format!("{}-exec-{sequence}", unit.name)),
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceLimits;

    fn spec(name: &str, merchant: &str) -> UnitSpec {
        UnitSpec {
            name: name.into(),
            merchant: merchant.into(),
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn ensure_unit_is_idempotent_for_the_owner() {
        let backend = InMemoryBackend::default();
        let first = backend.ensure_unit(&spec("shopify-a", "a.myshopify.com")).await.unwrap();
        let second = backend.ensure_unit(&spec("shopify-a", "a.myshopify.com")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(backend.unit_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn foreign_units_collide() {
        let backend = InMemoryBackend::default();
        backend
            .register_foreign_unit("shopify-a", "a-other.myshopify.com")
            .unwrap();

        let err = backend
            .ensure_unit(&spec("shopify-a", "a.myshopify.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NameCollision { .. }));
    }
}
