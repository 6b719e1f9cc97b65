//! Network interfaces

use super::{delete_if_owned, get_optional};
use crate::arm::{ArmApi, NETWORK_API_VERSION, NETWORK_NAMESPACE, ResourceId};
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::{
    BuildParams, CapabilityCache, ResourceKind, ResourceLifecycle, ResourceReconciler, Result,
    ResultExt, Tags,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    pub name: String,
    pub subnet_id: Option<ResourceId>,
    pub public_ip_name: Option<String>,
    pub backend_pools: Vec<ResourceId>,
    pub nat_rules: Vec<ResourceId>,
    pub vm_size: String,
    /// Explicit override; otherwise looked up in the capability cache
    pub accelerated_networking: Option<bool>,
}

pub struct NetworkInterfaceService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
    capabilities: Arc<CapabilityCache>,
}

impl NetworkInterfaceService {
    pub fn new(
        arm: Arc<dyn ArmApi>,
        cluster: Arc<ClusterContext>,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        Self {
            arm,
            cluster,
            capabilities,
        }
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.cluster
            .resource_id(NETWORK_NAMESPACE, "networkInterfaces", name)
    }

    async fn accelerated_networking(&self, spec: &NetworkInterfaceSpec) -> Result<bool> {
        match spec.accelerated_networking {
            Some(enabled) => Ok(enabled),
            None => {
                self.capabilities
                    .has_accelerated_networking(&spec.vm_size, self.cluster.location())
                    .await
            }
        }
    }

    fn ip_configuration(&self, spec: &NetworkInterfaceSpec) -> Value {
        let mut properties = serde_json::Map::new();
        if let Some(subnet) = &spec.subnet_id {
            properties.insert("subnet".into(), json!({ "id": subnet.as_str() }));
        }
        properties.insert("privateIPAllocationMethod".into(), json!("Dynamic"));
        if let Some(pip) = &spec.public_ip_name {
            let id = self
                .cluster
                .resource_id(NETWORK_NAMESPACE, "publicIPAddresses", pip);
            properties.insert("publicIPAddress".into(), json!({ "id": id.as_str() }));
        }
        if !spec.backend_pools.is_empty() {
            let pools: Vec<Value> = spec
                .backend_pools
                .iter()
                .map(|id| json!({ "id": id.as_str() }))
                .collect();
            properties.insert("loadBalancerBackendAddressPools".into(), Value::Array(pools));
        }
        if !spec.nat_rules.is_empty() {
            let rules: Vec<Value> = spec
                .nat_rules
                .iter()
                .map(|id| json!({ "id": id.as_str() }))
                .collect();
            properties.insert("loadBalancerInboundNatRules".into(), Value::Array(rules));
        }

        json!({
            "name": "pipConfig",
            "properties": Value::Object(properties),
        })
    }
}

#[async_trait]
impl ResourceReconciler for NetworkInterfaceService {
    type Spec = NetworkInterfaceSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::NetworkInterface
    }

    async fn reconcile(&self, spec: &NetworkInterfaceSpec) -> Result<()> {
        let id = self.id(&spec.name);
        let rg = self.cluster.resource_group();
        if get_optional(self.arm.as_ref(), &id, NETWORK_API_VERSION)
            .await
            .context(|| {
                format!(
                    "failed to get network interface {} in resource group {}",
                    spec.name, rg
                )
            })?
            .is_some()
        {
            debug!(nic = %spec.name, "network interface already exists");
            return Ok(());
        }

        let accelerated = self.accelerated_networking(spec).await.context(|| {
            format!(
                "failed to get accelerated networking capability for size {}",
                spec.vm_size
            )
        })?;

        info!(nic = %spec.name, resource_group = rg, accelerated, "creating network interface");
        let tags = Tags::build(BuildParams {
            cluster_name: &self.cluster.name,
            lifecycle: ResourceLifecycle::Owned,
            name: Some(&spec.name),
            role: None,
            additional: self.cluster.additional_tags(),
        });
        let body = json!({
            "location": self.cluster.location(),
            "tags": tags.to_json(),
            "properties": {
                "enableAcceleratedNetworking": accelerated,
                "ipConfigurations": [self.ip_configuration(spec)],
            },
        });
        self.arm
            .put(&id, NETWORK_API_VERSION, &body)
            .await
            .context(|| {
                format!(
                    "failed to create network interface {} in resource group {}",
                    spec.name, rg
                )
            })?;
        Ok(())
    }

    async fn delete(&self, spec: &NetworkInterfaceSpec) -> Result<()> {
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
