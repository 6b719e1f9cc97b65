//! Resource reconciler contract

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Uniform capability implemented by every dependent-resource adapter
///
/// Each adapter names the concrete spec it accepts, so handing a NIC spec to
/// the public IP adapter does not compile.
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    type Spec: Send + Sync;

    /// Resource family handled by this adapter
    fn kind(&self) -> ResourceKind;

    /// Create the resource if absent. A resource that already exists is left
    /// untouched, so repeated calls issue no provider mutation.
    async fn reconcile(&self, spec: &Self::Spec) -> Result<()>;

    /// Delete the resource. A resource that is already gone is a success.
    async fn delete(&self, spec: &Self::Spec) -> Result<()>;
}

/// Resource families managed by the orchestrators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    ResourceGroup,
    VirtualNetwork,
    Subnet,
    LoadBalancer,
    PublicIp,
    InboundNatRule,
    NetworkInterface,
    VirtualMachine,
    Disk,
    RoleAssignment,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::ResourceGroup => write!(f, "resource group"),
            ResourceKind::VirtualNetwork => write!(f, "virtual network"),
            ResourceKind::Subnet => write!(f, "subnet"),
            ResourceKind::LoadBalancer => write!(f, "load balancer"),
            ResourceKind::PublicIp => write!(f, "public IP"),
            ResourceKind::InboundNatRule => write!(f, "inbound NAT rule"),
            ResourceKind::NetworkInterface => write!(f, "network interface"),
            ResourceKind::VirtualMachine => write!(f, "virtual machine"),
            ResourceKind::Disk => write!(f, "disk"),
            ResourceKind::RoleAssignment => write!(f, "role assignment"),
        }
    }
}
