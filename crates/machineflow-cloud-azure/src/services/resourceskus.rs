//! Compute SKU catalog

use crate::arm::{ArmApi, COMPUTE_NAMESPACE, ResourceId, SKUS_API_VERSION};
use async_trait::async_trait;
use machineflow_cloud::{CatalogClient, CloudError, Result, ResultExt, Sku};
use std::sync::Arc;
use tracing::debug;

/// [`CatalogClient`] over the `Microsoft.Compute/skus` listing
pub struct SkuCatalogClient {
    arm: Arc<dyn ArmApi>,
    subscription_id: String,
}

impl SkuCatalogClient {
    pub fn new(arm: Arc<dyn ArmApi>, subscription_id: impl Into<String>) -> Self {
        Self {
            arm,
            subscription_id: subscription_id.into(),
        }
    }

    pub fn path(&self) -> String {
        format!(
            "{}/providers/{}/skus",
            ResourceId::subscription(&self.subscription_id),
            COMPUTE_NAMESPACE
        )
    }
}

#[async_trait]
impl CatalogClient for SkuCatalogClient {
    async fn list(&self, location: &str) -> Result<Vec<Sku>> {
        let filter = format!("location eq '{}'", location);
        let items = self
            .arm
            .list(&self.path(), SKUS_API_VERSION, Some(&filter))
            .await
            .context(|| format!("failed to list resource SKUs for {}", location))?;

        debug!(location, count = items.len(), "listed resource SKUs");
        items
            .into_iter()
            .map(|item| serde_json::from_value::<Sku>(item).map_err(CloudError::from))
            .collect()
    }
}
