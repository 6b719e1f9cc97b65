//! Virtual networks
//!
//! A vnet supplied by the user (no ownership tag) is used as is and never
//! deleted.

use super::{delete_if_owned, get_optional};
use crate::arm::{ArmApi, NETWORK_API_VERSION, NETWORK_NAMESPACE, ResourceId};
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::tags::COMMON_ROLE;
use machineflow_cloud::{
    BuildParams, ResourceKind, ResourceLifecycle, ResourceReconciler, Result, ResultExt, Tags,
    is_managed,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnetSpec {
    pub resource_group: String,
    pub name: String,
    pub cidr: String,
}

pub struct VirtualNetworkService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl VirtualNetworkService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    fn id(&self, spec: &VnetSpec) -> ResourceId {
        ResourceId::resource_group(&self.cluster.subscription_id, &spec.resource_group).provider(
            NETWORK_NAMESPACE,
            "virtualNetworks",
            &spec.name,
        )
    }
}

#[async_trait]
impl ResourceReconciler for VirtualNetworkService {
    type Spec = VnetSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::VirtualNetwork
    }

    async fn reconcile(&self, spec: &VnetSpec) -> Result<()> {
        let id = self.id(spec);
        let existing = get_optional(self.arm.as_ref(), &id, NETWORK_API_VERSION)
            .await
            .context(|| {
                format!(
                    "failed to get VNet {} in resource group {}",
                    spec.name, spec.resource_group
                )
            })?;

        if let Some(existing) = existing {
            let tags = Tags::from_json(existing.get("tags"));
            if !is_managed(&tags, &self.cluster.name) {
                info!(
                    vnet = %spec.name,
                    resource_group = %spec.resource_group,
                    "working on custom VNet"
                );
            }
            return Ok(());
        }

        info!(vnet = %spec.name, cidr = %spec.cidr, "creating VNet");
        let tags = Tags::build(BuildParams {
            cluster_name: &self.cluster.name,
            lifecycle: ResourceLifecycle::Owned,
            name: Some(&spec.name),
            role: Some(COMMON_ROLE),
            additional: self.cluster.additional_tags(),
        });
        let body = json!({
            "location": self.cluster.location(),
            "tags": tags.to_json(),
            "properties": {
                "addressSpace": { "addressPrefixes": [spec.cidr] },
            },
        });
        self.arm
            .put(&id, NETWORK_API_VERSION, &body)
            .await
            .context(|| {
                format!(
                    "failed to create VNet {} in resource group {}",
                    spec.name, spec.resource_group
                )
            })?;
        Ok(())
    }

    async fn delete(&self, spec: &VnetSpec) -> Result<()> {
        delete_if_owned(
            self.arm.as_ref(),
            self.kind(),
            &self.id(spec),
            NETWORK_API_VERSION,
            &spec.resource_group,
            &self.cluster.name,
        )
        .await
    }
}
