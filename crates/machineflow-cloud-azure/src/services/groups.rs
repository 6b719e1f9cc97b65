//! Resource groups

use super::{delete_if_owned, get_optional};
use crate::arm::{ArmApi, RESOURCES_API_VERSION, ResourceId};
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
pub struct GroupSpec {
    pub name: String,
    pub location: String,
}

pub struct GroupService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl GroupService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }
}

#[async_trait]
impl ResourceReconciler for GroupService {
    type Spec = GroupSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::ResourceGroup
    }

    async fn reconcile(&self, spec: &GroupSpec) -> Result<()> {
        let id = ResourceId::resource_group(&self.cluster.subscription_id, &spec.name);
        if get_optional(self.arm.as_ref(), &id, RESOURCES_API_VERSION)
            .await
            .context(|| format!("failed to get resource group {}", spec.name))?
            .is_some()
        {
            debug!(resource_group = %spec.name, "resource group already exists");
            return Ok(());
        }

        info!(resource_group = %spec.name, location = %spec.location, "creating resource group");
        let tags = Tags::build(BuildParams {
            cluster_name: &self.cluster.name,
            lifecycle: ResourceLifecycle::Owned,
            name: Some(&spec.name),
            role: Some(COMMON_ROLE),
            additional: self.cluster.additional_tags(),
        });
        let body = json!({
            "location": spec.location,
            "tags": tags.to_json(),
        });
        self.arm
            .put(&id, RESOURCES_API_VERSION, &body)
            .await
            .context(|| format!("failed to create resource group {}", spec.name))?;
        Ok(())
    }

    async fn delete(&self, spec: &GroupSpec) -> Result<()> {
        let id = ResourceId::resource_group(&self.cluster.subscription_id, &spec.name);
        delete_if_owned(
            self.arm.as_ref(),
            self.kind(),
            &id,
            RESOURCES_API_VERSION,
            &spec.name,
            &self.cluster.name,
        )
        .await
    }
}
