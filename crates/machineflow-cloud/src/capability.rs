//! Provider capability catalog cache
//!
//! The provider only offers a full catalog listing, so filtering by size is
//! done client-side. One listing per location populates every size offered
//! there; entries are never evicted for the lifetime of the cache.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Capability flag advertising accelerated networking support
pub const ACCELERATED_NETWORKING_CAPABILITY: &str = "AcceleratedNetworkingEnabled";

/// Resource type of virtual-machine sizes in the catalog
pub const VIRTUAL_MACHINES_RESOURCE_TYPE: &str = "virtualMachines";

/// Client for the provider's capability catalog
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// List the full catalog visible for `location`
    async fn list(&self, location: &str) -> Result<Vec<Sku>>;
}

/// One catalog entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sku {
    pub name: String,
    pub resource_type: String,
    #[serde(default)]
    pub location_info: Vec<SkuLocationInfo>,
    #[serde(default)]
    pub capabilities: Vec<SkuCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuLocationInfo {
    pub location: String,
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuCapability {
    pub name: String,
    pub value: String,
}

/// What a machine size supports in one location
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeCapabilities {
    /// Zones in the order the provider returned them
    pub zones: Vec<String>,
    pub accelerated_networking: bool,
}

type LocationCatalog = HashMap<String, SizeCapabilities>;

/// Shared, read-mostly cache of capability data keyed by (size, location)
///
/// Safe to share across concurrent reconciliations; at most one catalog
/// listing is in flight per location. A failed listing leaves the location
/// unpopulated so the next caller retries it.
pub struct CapabilityCache {
    client: Arc<dyn CatalogClient>,
    locations: Mutex<HashMap<String, Arc<OnceCell<LocationCatalog>>>>,
}

impl CapabilityCache {
    pub fn new(client: Arc<dyn CatalogClient>) -> Self {
        Self {
            client,
            locations: Mutex::new(HashMap::new()),
        }
    }

    /// Capabilities of `size` in `location`; unknown sizes yield the default
    pub async fn capabilities(&self, size: &str, location: &str) -> Result<SizeCapabilities> {
        let location = location.to_ascii_lowercase();
        let cell = {
            let mut locations = self.locations.lock().await;
            locations.entry(location.clone()).or_default().clone()
        };

        let catalog = cell
            .get_or_try_init(|| self.populate(&location))
            .await?;

        Ok(catalog
            .get(&size.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    /// Zones offering `size` in `location`, in provider order
    pub async fn zones_for_size(&self, size: &str, location: &str) -> Result<Vec<String>> {
        Ok(self.capabilities(size, location).await?.zones)
    }

    pub async fn has_accelerated_networking(&self, size: &str, location: &str) -> Result<bool> {
        if size.is_empty() {
            return Ok(false);
        }
        Ok(self
            .capabilities(size, location)
            .await?
            .accelerated_networking)
    }

    async fn populate(&self, location: &str) -> Result<LocationCatalog> {
        let skus = self.client.list(location).await?;
        let mut catalog = LocationCatalog::new();

        for sku in skus {
            if !sku
                .resource_type
                .eq_ignore_ascii_case(VIRTUAL_MACHINES_RESOURCE_TYPE)
            {
                continue;
            }

            let Some(info) = sku
                .location_info
                .iter()
                .find(|info| info.location.eq_ignore_ascii_case(location))
            else {
                continue;
            };

            let accelerated_networking = sku.capabilities.iter().any(|c| {
                c.name == ACCELERATED_NETWORKING_CAPABILITY && c.value.eq_ignore_ascii_case("true")
            });

            catalog.insert(
                sku.name.to_ascii_lowercase(),
                SizeCapabilities {
                    zones: info.zones.clone(),
                    accelerated_networking,
                },
            );
        }

        tracing::debug!(location, sizes = catalog.len(), "populated capability catalog");
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloudError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingCatalog {
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl CountingCatalog {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: false,
            }
        }
    }

    fn vm_sku(name: &str, location: &str, zones: &[&str], accelerated: bool) -> Sku {
        Sku {
            name: name.to_string(),
            resource_type: VIRTUAL_MACHINES_RESOURCE_TYPE.to_string(),
            location_info: vec![SkuLocationInfo {
                location: location.to_string(),
                zones: zones.iter().map(|z| z.to_string()).collect(),
            }],
            capabilities: vec![SkuCapability {
                name: ACCELERATED_NETWORKING_CAPABILITY.to_string(),
                value: if accelerated { "True" } else { "False" }.to_string(),
            }],
        }
    }

    #[async_trait]
    impl CatalogClient for CountingCatalog {
        async fn list(&self, location: &str) -> Result<Vec<Sku>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_first && call == 0 {
                return Err(CloudError::Transient("catalog unavailable".into()));
            }
            Ok(vec![
                vm_sku("Standard_D2s_v3", location, &["1", "2", "3"], true),
                vm_sku("Standard_B1s", location, &[], false),
                Sku {
                    name: "Premium_LRS".to_string(),
                    resource_type: "disks".to_string(),
                    ..Default::default()
                },
            ])
        }
    }

    #[tokio::test]
    async fn test_zones_for_size_uses_provider_order() {
        let cache = CapabilityCache::new(Arc::new(CountingCatalog::new()));
        let zones = cache.zones_for_size("Standard_D2s_v3", "eastus").await.unwrap();
        assert_eq!(zones, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_unknown_size_has_no_zones() {
        let cache = CapabilityCache::new(Arc::new(CountingCatalog::new()));
        assert!(cache.zones_for_size("Standard_X", "eastus").await.unwrap().is_empty());
        assert!(!cache.has_accelerated_networking("", "eastus").await.unwrap());
    }

    #[tokio::test]
    async fn test_catalog_listed_once_per_location() {
        let catalog = Arc::new(CountingCatalog::new());
        let cache = CapabilityCache::new(catalog.clone());

        assert!(cache.has_accelerated_networking("standard_d2s_v3", "EastUS").await.unwrap());
        assert!(!cache.has_accelerated_networking("Standard_B1s", "eastus").await.unwrap());
        cache.zones_for_size("Standard_D2s_v3", "eastus").await.unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);

        cache.zones_for_size("Standard_D2s_v3", "westeurope").await.unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_populate() {
        let catalog = Arc::new(CountingCatalog::new());
        let cache = Arc::new(CapabilityCache::new(catalog.clone()));

        let lookups = (0..8).map(|_| {
            let cache = cache.clone();
            async move { cache.zones_for_size("Standard_D2s_v3", "eastus").await }
        });
        let results = futures_util::future::join_all(lookups).await;

        assert!(results.iter().all(|r| r.as_ref().unwrap().len() == 3));
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_populate_is_retried() {
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let cache = CapabilityCache::new(catalog.clone());

        let err = cache.zones_for_size("Standard_D2s_v3", "eastus").await.unwrap_err();
        assert!(err.is_retryable());

        let zones = cache.zones_for_size("Standard_D2s_v3", "eastus").await.unwrap();
        assert_eq!(zones.len(), 3);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    }
}
