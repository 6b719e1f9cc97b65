//! Declarative machine and cluster descriptions
//!
//! These are the user-facing shapes stored in the watched objects, plus the
//! per-reconcile [`MachineSpec`] and [`ClusterContext`] built from them.

use crate::arm::{NETWORK_NAMESPACE, ResourceId};
use crate::names;
use machineflow_cloud::tags::{CONTROL_PLANE_ROLE, NODE_ROLE};
use machineflow_cloud::{CloudError, Result, Tags};
use serde::{Deserialize, Serialize};

/// Publisher and offer of the default Kubernetes node images
pub const DEFAULT_IMAGE_PUBLISHER: &str = "cncf-upstream";
pub const DEFAULT_IMAGE_OFFER: &str = "capi";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineRole {
    ControlPlane,
    #[default]
    Node,
}

impl MachineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineRole::ControlPlane => CONTROL_PLANE_ROLE,
            MachineRole::Node => NODE_ROLE,
        }
    }
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS image source; exactly one of the fields is expected to be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<MarketplaceImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_gallery: Option<SharedGalleryImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceImage {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedGalleryImage {
    pub subscription_id: String,
    pub resource_group: String,
    pub gallery: String,
    pub name: String,
    pub version: String,
}

impl Image {
    /// ARM `imageReference` object
    pub fn image_reference(&self) -> Result<serde_json::Value> {
        if let Some(id) = &self.id {
            return Ok(serde_json::json!({ "id": id }));
        }
        if let Some(gallery) = &self.shared_gallery {
            let id = ResourceId::resource_group(&gallery.subscription_id, &gallery.resource_group)
                .provider(
                    crate::arm::COMPUTE_NAMESPACE,
                    "galleries",
                    &gallery.gallery,
                )
                .child("images", &gallery.name)
                .child("versions", &gallery.version);
            return Ok(serde_json::json!({ "id": id.as_str() }));
        }
        if let Some(m) = &self.marketplace {
            return Ok(serde_json::json!({
                "publisher": m.publisher,
                "offer": m.offer,
                "sku": m.sku,
                "version": m.version,
            }));
        }
        Err(CloudError::InvalidSpec(
            "image must specify an id, a shared gallery or a marketplace image".into(),
        ))
    }
}

/// Default Ubuntu node image for a Kubernetes version such as `v1.18.2`
pub fn default_ubuntu_image(version: Option<&str>) -> Result<Image> {
    let version = version.ok_or_else(|| {
        CloudError::InvalidSpec("machine has no Kubernetes version to derive an image".into())
    })?;
    let trimmed = version.trim_start_matches('v');
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.parse::<u32>().is_err()) {
        return Err(CloudError::InvalidSpec(format!(
            "unable to parse Kubernetes version {:?}",
            version
        )));
    }

    Ok(Image {
        marketplace: Some(MarketplaceImage {
            publisher: DEFAULT_IMAGE_PUBLISHER.to_string(),
            offer: DEFAULT_IMAGE_OFFER.to_string(),
            sku: format!("k8s-{}-ubuntu-1804", parts.join("dot")),
            version: "latest".to_string(),
        }),
        ..Default::default()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDisk {
    pub storage_account_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsDisk {
    pub os_type: String,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: i32,
    pub managed_disk: ManagedDisk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    pub name_suffix: String,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lun: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmIdentity {
    #[default]
    None,
    SystemAssigned,
    UserAssigned,
}

/// Deprecated placement hint kept for older machine definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotVmOptions {
    /// Maximum hourly price; `None` caps at the on-demand price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
}

/// Declarative description of one machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureMachineSpec {
    pub vm_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    pub os_disk: OsDisk,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_disks: Vec<DataDisk>,
    /// Base64-encoded authorized key line
    pub ssh_public_key: String,
    #[serde(default)]
    pub identity: VmIdentity,
    /// Provider ids of user-assigned identities
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_assigned_identities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_assignment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
    #[serde(default)]
    pub availability_zone: AvailabilityZone,
    #[serde(default, rename = "allocatePublicIP")]
    pub allocate_public_ip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerated_networking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_vm_options: Option<SpotVmOptions>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub additional_tags: Tags,
}

/// Everything the orchestrator needs about one machine, built per reconcile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineSpec {
    pub name: String,
    pub role: MachineRole,
    /// Kubernetes version used to derive the default image
    pub version: Option<String>,
    /// Base64-encoded boot data
    pub bootstrap_data: String,
    pub spec: AzureMachineSpec,
}

impl MachineSpec {
    pub fn is_control_plane(&self) -> bool {
        self.role == MachineRole::ControlPlane
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnetSpec {
    /// Defaults to the cluster resource group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub vnet: VnetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_subnet_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_subnet_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_lb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_outbound_lb: Option<String>,
}

/// Declarative description of the cluster infrastructure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterSpec {
    pub resource_group: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub network_spec: NetworkSpec,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub additional_tags: Tags,
}

/// Cluster-wide facts shared by every resource of one reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterContext {
    pub name: String,
    pub subscription_id: String,
    pub spec: AzureClusterSpec,
    /// Whether the location offers availability zones
    pub zonal: bool,
}

impl ClusterContext {
    pub fn resource_group(&self) -> &str {
        &self.spec.resource_group
    }

    pub fn location(&self) -> &str {
        &self.spec.location
    }

    pub fn additional_tags(&self) -> &Tags {
        &self.spec.additional_tags
    }

    pub fn resource_group_id(&self) -> ResourceId {
        ResourceId::resource_group(&self.subscription_id, self.resource_group())
    }

    /// Id of a resource in the cluster resource group
    pub fn resource_id(&self, namespace: &str, resource_type: &str, name: &str) -> ResourceId {
        self.resource_group_id()
            .provider(namespace, resource_type, name)
    }

    pub fn vnet_resource_group(&self) -> &str {
        self.spec
            .network_spec
            .vnet
            .resource_group
            .as_deref()
            .unwrap_or(self.resource_group())
    }

    pub fn vnet_name(&self) -> String {
        self.spec
            .network_spec
            .vnet
            .name
            .clone()
            .unwrap_or_else(|| names::vnet_name(&self.name))
    }

    pub fn vnet_cidr(&self) -> String {
        self.spec
            .network_spec
            .vnet
            .cidr_block
            .clone()
            .unwrap_or_else(|| names::DEFAULT_VNET_CIDR.to_string())
    }

    pub fn vnet_id(&self) -> ResourceId {
        ResourceId::resource_group(&self.subscription_id, self.vnet_resource_group()).provider(
            NETWORK_NAMESPACE,
            "virtualNetworks",
            &self.vnet_name(),
        )
    }

    pub fn subnet_name(&self, role: MachineRole) -> String {
        let network = &self.spec.network_spec;
        match role {
            MachineRole::ControlPlane => network
                .control_plane_subnet
                .clone()
                .unwrap_or_else(|| names::control_plane_subnet_name(&self.name)),
            MachineRole::Node => network
                .node_subnet
                .clone()
                .unwrap_or_else(|| names::node_subnet_name(&self.name)),
        }
    }

    pub fn subnet_cidr(&self, role: MachineRole) -> String {
        let network = &self.spec.network_spec;
        let (cidr, default) = match role {
            MachineRole::ControlPlane => (
                &network.control_plane_subnet_cidr,
                names::DEFAULT_CONTROL_PLANE_SUBNET_CIDR,
            ),
            MachineRole::Node => (&network.node_subnet_cidr, names::DEFAULT_NODE_SUBNET_CIDR),
        };
        cidr.clone().unwrap_or_else(|| default.to_string())
    }

    pub fn subnet_id(&self, role: MachineRole) -> ResourceId {
        self.vnet_id().child("subnets", &self.subnet_name(role))
    }

    /// Public load balancer fronting the API server; `None` for private clusters
    pub fn api_server_lb(&self) -> Option<String> {
        self.spec.network_spec.api_server_lb.clone()
    }

    pub fn node_outbound_lb(&self) -> Option<String> {
        self.spec.network_spec.node_outbound_lb.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ubuntu_image() {
        let image = default_ubuntu_image(Some("v1.18.2")).unwrap();
        let m = image.marketplace.unwrap();
        assert_eq!(m.publisher, "cncf-upstream");
        assert_eq!(m.offer, "capi");
        assert_eq!(m.sku, "k8s-1dot18dot2-ubuntu-1804");
        assert_eq!(m.version, "latest");
    }

    #[test]
    fn test_default_image_requires_parsable_version() {
        assert!(default_ubuntu_image(None).unwrap_err().is_terminal());
        assert!(default_ubuntu_image(Some("v1.18")).unwrap_err().is_terminal());
        assert!(default_ubuntu_image(Some("latest")).unwrap_err().is_terminal());
    }

    #[test]
    fn test_image_reference_prefers_id() {
        let image = Image {
            id: Some("/subscriptions/s/images/custom".into()),
            marketplace: Some(MarketplaceImage::default()),
            ..Default::default()
        };
        assert_eq!(
            image.image_reference().unwrap(),
            serde_json::json!({ "id": "/subscriptions/s/images/custom" })
        );
        assert!(Image::default().image_reference().is_err());
    }

    #[test]
    fn test_cluster_context_defaults() {
        let ctx = ClusterContext {
            name: "demo".into(),
            subscription_id: "sub".into(),
            spec: AzureClusterSpec {
                resource_group: "rg".into(),
                location: "eastus".into(),
                ..Default::default()
            },
            zonal: true,
        };

        assert_eq!(ctx.vnet_name(), "demo-vnet");
        assert_eq!(ctx.vnet_resource_group(), "rg");
        assert_eq!(ctx.subnet_name(MachineRole::Node), "demo-node-subnet");
        assert_eq!(ctx.subnet_cidr(MachineRole::ControlPlane), "10.0.0.0/16");
        assert_eq!(ctx.subnet_cidr(MachineRole::Node), "10.1.0.0/16");
        assert!(
            ctx.subnet_id(MachineRole::ControlPlane)
                .as_str()
                .ends_with("/virtualNetworks/demo-vnet/subnets/demo-controlplane-subnet")
        );
    }

    #[test]
    fn test_machine_spec_wire_shape() {
        let spec: AzureMachineSpec = serde_json::from_value(serde_json::json!({
            "vmSize": "Standard_D2s_v3",
            "osDisk": {
                "osType": "Linux",
                "diskSizeGB": 30,
                "managedDisk": { "storageAccountType": "Premium_LRS" }
            },
            "sshPublicKey": "c3NoLXJzYSBBQUFB",
            "allocatePublicIP": true,
            "availabilityZone": { "id": "2" }
        }))
        .unwrap();

        assert_eq!(spec.vm_size, "Standard_D2s_v3");
        assert_eq!(spec.os_disk.disk_size_gb, 30);
        assert!(spec.allocate_public_ip);
        assert_eq!(spec.availability_zone.id.as_deref(), Some("2"));
        assert_eq!(spec.identity, VmIdentity::None);
        assert!(spec.failure_domain.is_none());
    }
}
