//! One [`ResourceReconciler`](machineflow_cloud::ResourceReconciler) per ARM
//! resource type

pub mod disks;
pub mod groups;
pub mod inboundnatrules;
pub mod loadbalancers;
pub mod networkinterfaces;
pub mod publicips;
pub mod resourceskus;
pub mod roleassignments;
pub mod subnets;
pub mod virtualmachines;
pub mod virtualnetworks;

use crate::arm::{ArmApi, ResourceId};
use machineflow_cloud::{ResourceKind, Result, ResultExt, Tags, is_managed};
use serde_json::Value;
use tracing::{debug, info};

/// GET a resource, mapping not-found to `None`
pub(crate) async fn get_optional(
    arm: &dyn ArmApi,
    id: &ResourceId,
    api_version: &str,
) -> Result<Option<Value>> {
    match arm.get(id, api_version).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// DELETE a resource; one that is already gone counts as deleted
pub(crate) async fn delete_ignoring_not_found(
    arm: &dyn ArmApi,
    kind: ResourceKind,
    id: &ResourceId,
    api_version: &str,
    resource_group: &str,
) -> Result<()> {
    info!(name = id.name(), resource_group, "deleting {}", kind);
    match arm.delete(id, api_version).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(name = id.name(), "{} already deleted", kind);
            Ok(())
        }
        Err(e) => Err(e).context(|| {
            format!(
                "failed to delete {} {} in resource group {}",
                kind,
                id.name(),
                resource_group
            )
        }),
    }
}

/// DELETE a resource only if it carries this cluster's ownership tag
pub(crate) async fn delete_if_owned(
    arm: &dyn ArmApi,
    kind: ResourceKind,
    id: &ResourceId,
    api_version: &str,
    resource_group: &str,
    cluster_name: &str,
) -> Result<()> {
    let existing = get_optional(arm, id, api_version).await.context(|| {
        format!(
            "failed to get {} {} in resource group {}",
            kind,
            id.name(),
            resource_group
        )
    })?;
    let Some(existing) = existing else {
        debug!(name = id.name(), "{} already deleted", kind);
        return Ok(());
    };

    let tags = Tags::from_json(existing.get("tags"));
    if !is_managed(&tags, cluster_name) {
        info!(
            name = id.name(),
            resource_group, "{} is not managed by this cluster, skipping deletion", kind
        );
        return Ok(());
    }

    delete_ignoring_not_found(arm, kind, id, api_version, resource_group).await
}
