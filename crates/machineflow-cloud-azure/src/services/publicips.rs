//! Public IP addresses

use super::{delete_if_owned, get_optional};
use crate::arm::{ArmApi, NETWORK_API_VERSION, NETWORK_NAMESPACE, ResourceId};
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::tags::COMMON_ROLE;
use machineflow_cloud::{
    BuildParams, ResourceKind, ResourceLifecycle, ResourceReconciler, Result, ResultExt, Tags,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIpSpec {
    pub name: String,
    pub dns_name: String,
}

pub struct PublicIpService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl PublicIpService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.cluster
            .resource_id(NETWORK_NAMESPACE, "publicIPAddresses", name)
    }
}

#[async_trait]
impl ResourceReconciler for PublicIpService {
    type Spec = PublicIpSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::PublicIp
    }

    async fn reconcile(&self, spec: &PublicIpSpec) -> Result<()> {
        let id = self.id(&spec.name);
        let rg = self.cluster.resource_group();
        if get_optional(self.arm.as_ref(), &id, NETWORK_API_VERSION)
            .await
            .context(|| format!("failed to get public IP {} in resource group {}", spec.name, rg))?
            .is_some()
        {
            debug!(public_ip = %spec.name, "public IP already exists");
            return Ok(());
        }

        info!(public_ip = %spec.name, resource_group = rg, "creating public IP");
        let tags = Tags::build(BuildParams {
            cluster_name: &self.cluster.name,
            lifecycle: ResourceLifecycle::Owned,
            name: Some(&spec.name),
            role: Some(COMMON_ROLE),
            additional: self.cluster.additional_tags(),
        });
        let label = spec
            .dns_name
            .split('.')
            .next()
            .unwrap_or(&spec.name)
            .to_string();
        let body = json!({
            "location": self.cluster.location(),
            "tags": tags.to_json(),
            "sku": { "name": "Standard" },
            "properties": {
                "publicIPAddressVersion": "IPv4",
                "publicIPAllocationMethod": "Static",
                "dnsSettings": {
                    "domainNameLabel": label,
                    "fqdn": spec.dns_name,
                },
            },
        });
        self.arm
            .put(&id, NETWORK_API_VERSION, &body)
            .await
            .context(|| format!("cannot create public IP {} in resource group {}", spec.name, rg))?;
        Ok(())
    }

    async fn delete(&self, spec: &PublicIpSpec) -> Result<()> {
        delete_if_owned(
            self.arm.as_ref(),
            self.kind(),
            &self.id(&spec.name),
            NETWORK_API_VERSION,
            self.cluster.resource_group(),
            &self.cluster.name,
        )
        .await
    }
}
