//! Managed disks
//!
//! OS disks are created implicitly with their virtual machine, so only the
//! delete side does any work.

use super::delete_ignoring_not_found;
use crate::arm::{ArmApi, COMPUTE_NAMESPACE, DISK_API_VERSION, ResourceId};
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::{ResourceKind, ResourceReconciler, Result};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
}

pub struct DiskService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl DiskService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.cluster.resource_id(COMPUTE_NAMESPACE, "disks", name)
    }
}

#[async_trait]
impl ResourceReconciler for DiskService {
    type Spec = DiskSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Disk
    }

    async fn reconcile(&self, spec: &DiskSpec) -> Result<()> {
        debug!(disk = %spec.name, "disks are created with their virtual machine");
        Ok(())
    }

    async fn delete(&self, spec: &DiskSpec) -> Result<()> {
        delete_ignoring_not_found(
            self.arm.as_ref(),
            self.kind(),
            &self.id(&spec.name),
            DISK_API_VERSION,
            self.cluster.resource_group(),
        )
        .await
    }
}
