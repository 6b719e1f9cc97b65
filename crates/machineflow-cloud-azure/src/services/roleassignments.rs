//! Role assignments for system-assigned machine identities

use super::{delete_ignoring_not_found, get_optional};
use crate::arm::{ArmApi, AUTHORIZATION_API_VERSION, AUTHORIZATION_NAMESPACE, ResourceId};
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::{ResourceKind, ResourceReconciler, Result, ResultExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Built-in Contributor role
pub const CONTRIBUTOR_ROLE_ID: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignmentSpec {
    /// GUID name of the assignment
    pub name: String,
    pub principal_id: String,
}

/// Grants machine identities Contributor on the cluster resource group
pub struct RoleAssignmentService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl RoleAssignmentService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.cluster
            .resource_group_id()
            .provider(AUTHORIZATION_NAMESPACE, "roleAssignments", name)
    }

    fn role_definition_id(&self) -> ResourceId {
        ResourceId::subscription(&self.cluster.subscription_id).provider(
            AUTHORIZATION_NAMESPACE,
            "roleDefinitions",
            CONTRIBUTOR_ROLE_ID,
        )
    }
}

#[async_trait]
impl ResourceReconciler for RoleAssignmentService {
    type Spec = RoleAssignmentSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::RoleAssignment
    }

    async fn reconcile(&self, spec: &RoleAssignmentSpec) -> Result<()> {
        let id = self.id(&spec.name);
        if get_optional(self.arm.as_ref(), &id, AUTHORIZATION_API_VERSION)
            .await
            .context(|| format!("failed to get role assignment {}", spec.name))?
            .is_some()
        {
            debug!(role_assignment = %spec.name, "role assignment already exists");
            return Ok(());
        }

        info!(
            role_assignment = %spec.name,
            principal = %spec.principal_id,
            "creating role assignment"
        );
        let body = json!({
            "properties": {
                "roleDefinitionId": self.role_definition_id().as_str(),
                "principalId": spec.principal_id,
            },
        });
        self.arm
            .put(&id, AUTHORIZATION_API_VERSION, &body)
            .await
            .context(|| {
                format!(
                    "cannot assign role to {} system assigned identity",
                    spec.principal_id
                )
            })?;
        Ok(())
    }

    async fn delete(&self, spec: &RoleAssignmentSpec) -> Result<()> {
        delete_ignoring_not_found(
            self.arm.as_ref(),
            self.kind(),
            &self.id(&spec.name),
            AUTHORIZATION_API_VERSION,
            self.cluster.resource_group(),
        )
        .await
    }
}
