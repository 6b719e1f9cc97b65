//! Resource naming conventions
//!
//! Names derived from the machine or cluster name are how resources without
//! tags (NAT rules, role assignments, the implicit OS disk) are found again.

use uuid::Uuid;

pub const DEFAULT_VNET_CIDR: &str = "10.0.0.0/8";
pub const DEFAULT_CONTROL_PLANE_SUBNET_CIDR: &str = "10.0.0.0/16";
pub const DEFAULT_NODE_SUBNET_CIDR: &str = "10.1.0.0/16";

/// Administrator account created on every Linux machine
pub const ADMIN_USERNAME: &str = "capi";

pub fn vnet_name(cluster: &str) -> String {
    format!("{}-vnet", cluster)
}

pub fn control_plane_subnet_name(cluster: &str) -> String {
    format!("{}-controlplane-subnet", cluster)
}

pub fn node_subnet_name(cluster: &str) -> String {
    format!("{}-node-subnet", cluster)
}

/// Public IP fronting the API server load balancer
pub fn api_server_public_ip_name(cluster: &str) -> String {
    format!("pip-{}-apiserver", cluster)
}

/// Public IP used for node egress
pub fn node_outbound_public_ip_name(cluster: &str) -> String {
    format!("pip-{}-node-outbound", cluster)
}

pub fn nic_name(machine: &str) -> String {
    format!("{}-nic", machine)
}

pub fn public_nic_name(machine: &str) -> String {
    format!("{}-public-nic", machine)
}

pub fn node_public_ip_name(machine: &str) -> String {
    format!("pip-{}", machine)
}

pub fn os_disk_name(machine: &str) -> String {
    format!("{}_OSDisk", machine)
}

pub fn data_disk_name(machine: &str, suffix: &str) -> String {
    format!("{}_{}", machine, suffix)
}

pub fn frontend_ip_config_name(lb: &str) -> String {
    format!("{}-frontEnd", lb)
}

pub fn backend_pool_name(lb: &str) -> String {
    format!("{}-backendPool", lb)
}

pub fn outbound_backend_pool_name(lb: &str) -> String {
    format!("{}-outboundBackendPool", lb)
}

/// DNS label of a public IP, unique per location
pub fn public_ip_dns_name(name: &str, location: &str) -> String {
    format!("{}.{}.cloudapp.azure.com", name.to_lowercase(), location)
}

/// Stable role assignment name for a machine
///
/// Role assignment names must be GUIDs; deriving one from the machine's
/// location in the subscription keeps it identical across reconciles.
pub fn role_assignment_name(subscription_id: &str, resource_group: &str, machine: &str) -> String {
    let key = format!("{}/{}/{}", subscription_id, resource_group, machine);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}
