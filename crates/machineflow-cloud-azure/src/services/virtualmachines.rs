//! Virtual machines

use super::{delete_if_owned, get_optional};
use crate::arm::{
    ArmApi, COMPUTE_API_VERSION, COMPUTE_NAMESPACE, DEFAULT_POLL_INTERVAL, NETWORK_API_VERSION,
    NETWORK_NAMESPACE, ResourceId,
};
use crate::names;
use crate::spec::{
    ClusterContext, DataDisk, Image, MachineRole, OsDisk, SpotVmOptions, VmIdentity,
};
use async_trait::async_trait;
use machineflow_cloud::{
    AddressKind, BuildParams, ObservedVm, ProvisioningState, ResourceKind, ResourceLifecycle,
    ResourceReconciler, Result, ResultExt, TagChanges, Tags, VmAddress,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmSpec {
    pub name: String,
    pub role: MachineRole,
    /// Network interfaces in order; the first one is primary
    pub nic_names: Vec<String>,
    /// Decoded authorized key line
    pub ssh_key_data: String,
    pub size: String,
    pub os_disk: OsDisk,
    pub data_disks: Vec<DataDisk>,
    pub image: Image,
    /// Base64-encoded boot data
    pub custom_data: String,
    pub zone: Option<String>,
    pub identity: VmIdentity,
    pub user_assigned_identities: Vec<String>,
    pub spot_vm_options: Option<SpotVmOptions>,
    pub additional_tags: Tags,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    zones: Vec<String>,
    identity: Option<IdentityBody>,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityBody {
    principal_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    provisioning_state: Option<String>,
    #[serde(default)]
    network_profile: NetworkProfile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    #[serde(default)]
    network_interfaces: Vec<SubResource>,
}

#[derive(Debug, Default, Deserialize)]
struct SubResource {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkInterface {
    #[serde(default)]
    properties: NetworkInterfaceProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceProperties {
    #[serde(default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Default, Deserialize)]
struct IpConfiguration {
    #[serde(default)]
    properties: IpConfigurationProperties,
}

#[derive(Debug, Default, Deserialize)]
struct IpConfigurationProperties {
    #[serde(rename = "privateIPAddress")]
    private_ip_address: Option<String>,
    #[serde(rename = "publicIPAddress")]
    public_ip_address: Option<SubResource>,
}

#[derive(Debug, Default, Deserialize)]
struct PublicIpAddress {
    #[serde(default)]
    properties: PublicIpProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIpProperties {
    ip_address: Option<String>,
}

pub struct VirtualMachineService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl VirtualMachineService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.cluster
            .resource_id(COMPUTE_NAMESPACE, "virtualMachines", name)
    }

    /// Current provider view of a VM; not-found is returned as an error
    pub async fn get(&self, name: &str) -> Result<ObservedVm> {
        let value = self.arm.get(&self.id(name), COMPUTE_API_VERSION).await?;
        let vm: VirtualMachine = serde_json::from_value(value)?;
        self.observe(vm).await
    }

    /// Wait out a VM the provider is still deleting. Returns `true` once it is
    /// gone and `false` when it is present in any other state.
    pub async fn wait_deleted(&self, name: &str) -> Result<bool> {
        let id = self.id(name);
        loop {
            let Some(value) = get_optional(self.arm.as_ref(), &id, COMPUTE_API_VERSION)
                .await
                .context(|| format!("failed to get VM {}", name))?
            else {
                return Ok(true);
            };
            let vm: VirtualMachine = serde_json::from_value(value)?;
            let state = vm.properties.provisioning_state.as_deref();
            if state.map(ProvisioningState::parse) != Some(ProvisioningState::Deleting) {
                return Ok(false);
            }
            debug!(vm = name, "VM still deleting");
            tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        }
    }

    /// Bring the user tags of an existing VM in line with `changes`; ownership
    /// tags are never touched. Returns whether a PATCH was sent.
    pub async fn update_tags(&self, name: &str, changes: &TagChanges) -> Result<bool> {
        if changes.is_empty() {
            return Ok(false);
        }
        let id = self.id(name);
        let value = self
            .arm
            .get(&id, COMPUTE_API_VERSION)
            .await
            .context(|| format!("failed to get VM {}", name))?;
        let mut tags = Tags::from_json(value.get("tags"));
        if !tags.apply(changes) {
            return Ok(false);
        }

        info!(
            vm = name,
            set = changes.set.len(),
            remove = changes.remove.len(),
            "updating VM tags"
        );
        self.arm
            .patch(&id, COMPUTE_API_VERSION, &json!({ "tags": tags.to_json() }))
            .await
            .context(|| format!("failed to update tags of VM {}", name))?;
        Ok(true)
    }

    async fn observe(&self, vm: VirtualMachine) -> Result<ObservedVm> {
        let state = vm
            .properties
            .provisioning_state
            .as_deref()
            .map(ProvisioningState::parse)
            .unwrap_or(ProvisioningState::Undefined);

        let mut addresses = vec![VmAddress::new(AddressKind::InternalDNS, vm.name.clone())];
        for nic_ref in &vm.properties.network_profile.network_interfaces {
            addresses.extend(self.nic_addresses(&ResourceId::parse(&nic_ref.id)).await?);
        }

        Ok(ObservedVm {
            id: vm.id,
            name: vm.name,
            state,
            addresses,
            principal_id: vm.identity.and_then(|i| i.principal_id),
            zone: vm.zones.into_iter().next(),
        })
    }

    async fn nic_addresses(&self, nic_id: &ResourceId) -> Result<Vec<VmAddress>> {
        let Some(value) = get_optional(self.arm.as_ref(), nic_id, NETWORK_API_VERSION)
            .await
            .context(|| format!("failed to fetch network interface {}", nic_id.name()))?
        else {
            debug!(nic = nic_id.name(), "network interface of VM no longer exists");
            return Ok(Vec::new());
        };
        let nic: NetworkInterface = serde_json::from_value(value)?;

        let mut addresses = Vec::new();
        for config in nic.properties.ip_configurations {
            if let Some(ip) = config.properties.private_ip_address {
                addresses.push(VmAddress::new(AddressKind::InternalIP, ip));
            }
            let Some(pip_ref) = config.properties.public_ip_address else {
                continue;
            };
            let pip_id = ResourceId::parse(&pip_ref.id);
            let Some(value) = get_optional(self.arm.as_ref(), &pip_id, NETWORK_API_VERSION)
                .await
                .context(|| format!("failed to fetch public IP {}", pip_id.name()))?
            else {
                continue;
            };
            let pip: PublicIpAddress = serde_json::from_value(value)?;
            if let Some(ip) = pip.properties.ip_address {
                addresses.push(VmAddress::new(AddressKind::ExternalIP, ip));
            }
        }
        Ok(addresses)
    }

    /// ARM request body for a new VM
    pub fn body(&self, spec: &VmSpec) -> Result<Value> {
        let os_disk = json!({
            "name": names::os_disk_name(&spec.name),
            "osType": spec.os_disk.os_type,
            "createOption": "FromImage",
            "diskSizeGB": spec.os_disk.disk_size_gb,
            "caching": spec.os_disk.caching_type.as_deref().unwrap_or("None"),
            "managedDisk": {
                "storageAccountType": spec.os_disk.managed_disk.storage_account_type,
            },
        });
        let data_disks: Vec<Value> = spec
            .data_disks
            .iter()
            .enumerate()
            .map(|(i, disk)| {
                json!({
                    "name": names::data_disk_name(&spec.name, &disk.name_suffix),
                    "diskSizeGB": disk.disk_size_gb,
                    "lun": disk.lun.unwrap_or(i as i32),
                    "createOption": "Empty",
                })
            })
            .collect();
        let nics: Vec<Value> = spec
            .nic_names
            .iter()
            .enumerate()
            .map(|(i, nic)| {
                let id = self
                    .cluster
                    .resource_id(NETWORK_NAMESPACE, "networkInterfaces", nic);
                json!({ "id": id.as_str(), "properties": { "primary": i == 0 } })
            })
            .collect();

        let mut properties = json!({
            "hardwareProfile": { "vmSize": spec.size },
            "storageProfile": {
                "imageReference": spec.image.image_reference()?,
                "osDisk": os_disk,
                "dataDisks": data_disks,
            },
            "osProfile": {
                "computerName": spec.name,
                "adminUsername": names::ADMIN_USERNAME,
                "customData": spec.custom_data,
                "linuxConfiguration": {
                    "disablePasswordAuthentication": true,
                    "ssh": {
                        "publicKeys": [{
                            "path": format!("/home/{}/.ssh/authorized_keys", names::ADMIN_USERNAME),
                            "keyData": spec.ssh_key_data,
                        }],
                    },
                },
            },
            "networkProfile": { "networkInterfaces": nics },
        });
        if let Some(spot) = &spec.spot_vm_options {
            properties["priority"] = json!("Spot");
            properties["evictionPolicy"] = json!("Deallocate");
            // -1 caps the price at the on-demand rate
            properties["billingProfile"] = json!({ "maxPrice": spot.max_price.unwrap_or(-1.0) });
        }

        let tags = Tags::build(BuildParams {
            cluster_name: &self.cluster.name,
            lifecycle: ResourceLifecycle::Owned,
            name: Some(&spec.name),
            role: Some(spec.role.as_str()),
            additional: &spec.additional_tags,
        });
        let mut body = json!({
            "location": self.cluster.location(),
            "tags": tags.to_json(),
            "properties": properties,
        });
        if let Some(zone) = &spec.zone {
            body["zones"] = json!([zone]);
        }
        match spec.identity {
            VmIdentity::None => {}
            VmIdentity::SystemAssigned => {
                body["identity"] = json!({ "type": "SystemAssigned" });
            }
            VmIdentity::UserAssigned => {
                let ids: serde_json::Map<String, Value> = spec
                    .user_assigned_identities
                    .iter()
                    .map(|id| (id.clone(), json!({})))
                    .collect();
                body["identity"] = json!({
                    "type": "UserAssigned",
                    "userAssignedIdentities": ids,
                });
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl ResourceReconciler for VirtualMachineService {
    type Spec = VmSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::VirtualMachine
    }

    async fn reconcile(&self, spec: &VmSpec) -> Result<()> {
        let id = self.id(&spec.name);
        let rg = self.cluster.resource_group();
        if get_optional(self.arm.as_ref(), &id, COMPUTE_API_VERSION)
            .await
            .context(|| format!("failed to get VM {} in resource group {}", spec.name, rg))?
            .is_some()
        {
            debug!(vm = %spec.name, "VM already exists");
            return Ok(());
        }

        info!(vm = %spec.name, size = %spec.size, zone = ?spec.zone, "creating VM");
        let body = self.body(spec)?;
        self.arm
            .put(&id, COMPUTE_API_VERSION, &body)
            .await
            .context(|| format!("cannot create VM {} in resource group {}", spec.name, rg))?;
        Ok(())
    }

    async fn delete(&self, spec: &VmSpec) -> Result<()> {
        delete_if_owned(
            self.arm.as_ref(),
            self.kind(),
            &self.id(&spec.name),
            COMPUTE_API_VERSION,
            self.cluster.resource_group(),
            &self.cluster.name,
        )
        .await
    }
}
