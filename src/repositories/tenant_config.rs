//! # Tenant Config Repository
//!
//! CRUD over `tenant_configs`. The merchant domain is the immutable identity;
//! removal is always a soft deactivation.

use chrono::{NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value;

use crate::error::{OrchestratorError, is_unique_violation};
use crate::models::tenant_config::{ActiveModel, Column, Entity, Model};

const SHOP_SUFFIX: &str = ".myshopify.com";

/// Historical extraction starts here unless onboarding says otherwise.
pub fn default_backfill_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default()
}

/// Input for onboarding a new merchant
#[derive(Debug, Clone)]
pub struct NewTenantConfig {
    pub merchant: String,
    pub credential_ref: String,
    pub warehouse_project: String,
    pub warehouse_dataset: String,
    pub backfill_start_date: Option<NaiveDate>,
    pub metadata: Option<Value>,
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct TenantConfigPatch {
    pub credential_ref: Option<String>,
    pub warehouse_project: Option<String>,
    pub warehouse_dataset: Option<String>,
    pub backfill_start_date: Option<NaiveDate>,
    pub metadata: Option<Value>,
}

impl TenantConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.credential_ref.is_none()
            && self.warehouse_project.is_none()
            && self.warehouse_dataset.is_none()
            && self.backfill_start_date.is_none()
            && self.metadata.is_none()
    }
}

/// Canonicalizes a merchant identity to its bare shop domain.
///
/// Accepts `Acme.myshopify.com`, `https://acme.myshopify.com/` and similar; the
/// result is always lowercase `<shop>.myshopify.com`.
pub fn normalize_merchant(raw: &str) -> Result<String, OrchestratorError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::validation("merchant", "must not be empty"));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let host = url::Url::parse(&with_scheme)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .ok_or_else(|| OrchestratorError::validation("merchant", "is not a valid shop domain"))?;

    let Some(shop) = host.strip_suffix(SHOP_SUFFIX) else {
        return Err(OrchestratorError::validation(
            "merchant",
            format!("must end with {SHOP_SUFFIX}"),
        ));
    };
    if shop.is_empty() || shop.contains('.') {
        return Err(OrchestratorError::validation(
            "merchant",
            "shop name must be a single label before .myshopify.com",
        ));
    }

    Ok(host)
}

fn validate_dataset(dataset: &str) -> Result<(), OrchestratorError> {
    let valid = !dataset.is_empty()
        && dataset.len() <= 1024
        && dataset
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::validation(
            "warehouse_dataset",
            "must contain only letters, digits and underscores",
        ))
    }
}

fn require(field: &'static str, value: &str) -> Result<String, OrchestratorError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(OrchestratorError::validation(field, "must not be empty"))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Repository for tenant configuration rows
#[derive(Clone)]
pub struct TenantConfigRepository {
    db: DatabaseConnection,
}

impl TenantConfigRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Onboard a merchant. Fails with `TenantExists` if the identity is taken.
    pub async fn create(
        &self,
        request: NewTenantConfig,
        actor: Option<&str>,
    ) -> Result<Model, OrchestratorError> {
        let merchant = normalize_merchant(&request.merchant)?;
        let credential_ref = require("credential_ref", &request.credential_ref)?;
        let warehouse_project = require("warehouse_project", &request.warehouse_project)?;
        let warehouse_dataset = require("warehouse_dataset", &request.warehouse_dataset)?;
        validate_dataset(&warehouse_dataset)?;

        if !warehouse_dataset.starts_with("shopify_") {
            tracing::warn!(
                merchant = %merchant,
                dataset = %warehouse_dataset,
                "Warehouse dataset does not follow the shopify_ naming convention"
            );
        }

        let now = Utc::now().fixed_offset();
        let tenant = ActiveModel {
            merchant: Set(merchant.clone()),
            credential_ref: Set(credential_ref),
            warehouse_project: Set(warehouse_project),
            warehouse_dataset: Set(warehouse_dataset),
            backfill_start_date: Set(request
                .backfill_start_date
                .unwrap_or_else(default_backfill_start_date)),
            is_active: Set(true),
            metadata: Set(request.metadata),
            created_at: Set(now),
            created_by: Set(actor.map(str::to_string)),
            updated_at: Set(now),
            updated_by: Set(actor.map(str::to_string)),
        };

        let created = tenant.insert(&self.db).await.map_err(|err| {
            if is_unique_violation(&err) {
                OrchestratorError::TenantExists {
                    merchant: merchant.clone(),
                }
            } else {
                err.into()
            }
        })?;

        tracing::info!(merchant = %created.merchant, "Tenant config created");
        Ok(created)
    }

    pub async fn get(&self, merchant: &str) -> Result<Option<Model>, OrchestratorError> {
        let merchant = normalize_merchant(merchant)?;
        Ok(Entity::find_by_id(merchant).one(&self.db).await?)
    }

    /// Like [`get`](Self::get) but treats inactive tenants as absent.
    pub async fn find_active(&self, merchant: &str) -> Result<Option<Model>, OrchestratorError> {
        Ok(self.get(merchant).await?.filter(|tenant| tenant.is_active))
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<Model>, OrchestratorError> {
        let mut query = Entity::find().order_by_asc(Column::Merchant);
        if active_only {
            query = query.filter(Column::IsActive.eq(true));
        }
        Ok(query.all(&self.db).await?)
    }

    /// Apply a partial update. The merchant identity itself never changes.
    pub async fn update(
        &self,
        merchant: &str,
        patch: TenantConfigPatch,
        actor: Option<&str>,
    ) -> Result<Model, OrchestratorError> {
        if patch.is_empty() {
            return Err(OrchestratorError::validation(
                "patch",
                "at least one field must be provided",
            ));
        }

        let existing = self.require_existing(merchant).await?;
        let mut active = existing.into_active_model();

        if let Some(credential_ref) = patch.credential_ref {
            active.credential_ref = Set(require("credential_ref", &credential_ref)?);
        }
        if let Some(project) = patch.warehouse_project {
            active.warehouse_project = Set(require("warehouse_project", &project)?);
        }
        if let Some(dataset) = patch.warehouse_dataset {
            let dataset = require("warehouse_dataset", &dataset)?;
            validate_dataset(&dataset)?;
            active.warehouse_dataset = Set(dataset);
        }
        if let Some(start) = patch.backfill_start_date {
            active.backfill_start_date = Set(start);
        }
        if let Some(metadata) = patch.metadata {
            active.metadata = Set(Some(metadata));
        }
        active.updated_at = Set(Utc::now().fixed_offset());
        active.updated_by = Set(actor.map(str::to_string));

        let updated = active.update(&self.db).await?;
        tracing::info!(merchant = %updated.merchant, "Tenant config updated");
        Ok(updated)
    }

    pub async fn deactivate(
        &self,
        merchant: &str,
        actor: Option<&str>,
    ) -> Result<Model, OrchestratorError> {
        self.set_active(merchant, false, actor).await
    }

    pub async fn activate(
        &self,
        merchant: &str,
        actor: Option<&str>,
    ) -> Result<Model, OrchestratorError> {
        self.set_active(merchant, true, actor).await
    }

    async fn set_active(
        &self,
        merchant: &str,
        is_active: bool,
        actor: Option<&str>,
    ) -> Result<Model, OrchestratorError> {
        let existing = self.require_existing(merchant).await?;
        if existing.is_active == is_active {
            return Ok(existing);
        }

        let mut active = existing.into_active_model();
        active.is_active = Set(is_active);
        active.updated_at = Set(Utc::now().fixed_offset());
        active.updated_by = Set(actor.map(str::to_string));

        let updated = active.update(&self.db).await?;
        tracing::info!(merchant = %updated.merchant, is_active, "Tenant activation changed");
        Ok(updated)
    }

    async fn require_existing(&self, merchant: &str) -> Result<Model, OrchestratorError> {
        self.get(merchant)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownTenant {
                merchant: merchant.trim().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merchant_forms_normalize_to_shop_domain() {
        for raw in [
            "acme.myshopify.com",
            "  ACME.myshopify.com ",
            "https://acme.myshopify.com/",
            "http://Acme.MyShopify.com/admin",
        ] {
            assert_eq!(normalize_merchant(raw).unwrap(), "acme.myshopify.com", "{raw}");
        }
    }

    #[test]
    fn non_shop_domains_are_rejected() {
        for raw in ["", "acme.com", ".myshopify.com", "a.b.myshopify.com", "not a url"] {
            assert!(
                matches!(
                    normalize_merchant(raw),
                    Err(OrchestratorError::Validation { field: "merchant", .. })
                ),
                "{raw}"
            );
        }
    }

    #[test]
    fn dataset_names_are_checked() {
        assert!(validate_dataset("shopify_acme").is_ok());
        assert!(validate_dataset("shopify-acme").is_err());
        assert!(validate_dataset("").is_err());
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(TenantConfigPatch::default().is_empty());
        let patch = TenantConfigPatch {
            warehouse_dataset: Some("shopify_new".into()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
