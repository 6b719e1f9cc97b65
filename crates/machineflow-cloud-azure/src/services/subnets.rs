//! Subnets of the cluster virtual network
//!
//! Subnets follow their vnet: created and deleted only when the vnet is owned
//! by the cluster. A user supplied vnet must already hold every subnet.

use super::{delete_ignoring_not_found, get_optional};
use crate::arm::{ArmApi, NETWORK_API_VERSION, ResourceId};
use crate::spec::{ClusterContext, MachineRole};
use async_trait::async_trait;
use machineflow_cloud::{
    CloudError, ResourceKind, ResourceReconciler, Result, ResultExt, Tags, is_managed,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSpec {
    pub name: String,
    pub cidr: String,
    pub role: MachineRole,
}

pub struct SubnetService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl SubnetService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    fn id(&self, spec: &SubnetSpec) -> ResourceId {
        self.cluster.vnet_id().child("subnets", &spec.name)
    }

    /// Whether the cluster vnet exists and carries this cluster's ownership tag
    async fn vnet_managed(&self) -> Result<bool> {
        let vnet_id = self.cluster.vnet_id();
        let vnet = get_optional(self.arm.as_ref(), &vnet_id, NETWORK_API_VERSION)
            .await
            .context(|| format!("failed to get VNet {}", self.cluster.vnet_name()))?;
        Ok(vnet
            .map(|vnet| is_managed(&Tags::from_json(vnet.get("tags")), &self.cluster.name))
            .unwrap_or(false))
    }
}

#[async_trait]
impl ResourceReconciler for SubnetService {
    type Spec = SubnetSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Subnet
    }

    async fn reconcile(&self, spec: &SubnetSpec) -> Result<()> {
        let id = self.id(spec);
        let vnet = self.cluster.vnet_name();
        if get_optional(self.arm.as_ref(), &id, NETWORK_API_VERSION)
            .await
            .context(|| format!("failed to get subnet {} in VNet {}", spec.name, vnet))?
            .is_some()
        {
            debug!(subnet = %spec.name, "subnet already exists");
            return Ok(());
        }

        if !self.vnet_managed().await? {
            return Err(CloudError::InvalidSpec(format!(
                "VNet {} was provided but subnet {} is missing",
                vnet, spec.name
            )));
        }

        info!(subnet = %spec.name, cidr = %spec.cidr, role = %spec.role, "creating subnet");
        let body = json!({
            "properties": { "addressPrefix": spec.cidr },
        });
        self.arm
            .put(&id, NETWORK_API_VERSION, &body)
            .await
            .context(|| format!("failed to create subnet {} in VNet {}", spec.name, vnet))?;
        Ok(())
    }

    async fn delete(&self, spec: &SubnetSpec) -> Result<()> {
        if !self.vnet_managed().await? {
            debug!(subnet = %spec.name, "VNet not managed by this cluster, keeping subnet");
            return Ok(());
        }
        delete_ignoring_not_found(
            self.arm.as_ref(),
            self.kind(),
            &self.id(spec),
            NETWORK_API_VERSION,
            self.cluster.vnet_resource_group(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeArm, Method, cluster_context};

    fn setup() -> (Arc<FakeArm>, SubnetService, SubnetSpec) {
        let arm = Arc::new(FakeArm::new());
        let cluster = Arc::new(cluster_context());
        let spec = SubnetSpec {
            name: cluster.subnet_name(MachineRole::Node),
            cidr: cluster.subnet_cidr(MachineRole::Node),
            role: MachineRole::Node,
        };
        (arm.clone(), SubnetService::new(arm, cluster), spec)
    }

    fn owned_vnet(cluster: &ClusterContext) -> serde_json::Value {
        let tags = Tags::build(machineflow_cloud::BuildParams {
            cluster_name: &cluster.name,
            lifecycle: machineflow_cloud::ResourceLifecycle::Owned,
            name: None,
            role: None,
            additional: &Tags::new(),
        });
        json!({ "tags": tags.to_json() })
    }

    #[tokio::test]
    async fn test_subnet_created_in_owned_vnet() {
        let (arm, service, spec) = setup();
        arm.insert(&service.cluster.vnet_id(), owned_vnet(&service.cluster));

        service.reconcile(&spec).await.unwrap();
        let subnet = arm.resource(&service.id(&spec)).unwrap();
        assert_eq!(subnet["properties"]["addressPrefix"], "10.1.0.0/16");

        arm.clear_calls();
        service.reconcile(&spec).await.unwrap();
        assert!(arm.mutations().is_empty());

        service.delete(&spec).await.unwrap();
        assert!(!arm.contains(&service.id(&spec)));
    }

    #[tokio::test]
    async fn test_custom_vnet_must_hold_subnet() {
        let (arm, service, spec) = setup();
        arm.insert(&service.cluster.vnet_id(), json!({ "tags": { "team": "network" } }));

        let err = service.reconcile(&spec).await.unwrap_err();
        assert!(err.is_terminal());
        assert!(err.to_string().contains("demo-node-subnet"));

        let existing = json!({ "properties": { "addressPrefix": "10.9.0.0/16" } });
        arm.insert(&service.id(&spec), existing);
        service.reconcile(&spec).await.unwrap();
        service.delete(&spec).await.unwrap();
        assert!(arm.contains(&service.id(&spec)));
        assert_eq!(arm.count(Method::Delete, "/subnets/"), 0);
    }
}
