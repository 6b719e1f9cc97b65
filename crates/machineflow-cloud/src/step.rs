//! Ordered steps of the machine create and delete sequences

use crate::reconciler::ResourceKind;
use serde::{Deserialize, Serialize};

/// One step of a convergence sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    PublicIps,
    InboundNatRule,
    NetworkInterfaces,
    VirtualMachine,
    RoleAssignment,
    OsDisk,
}

/// Create order: each step may reference what earlier steps produced
pub const CREATE_ORDER: [Step; 5] = [
    Step::PublicIps,
    Step::InboundNatRule,
    Step::NetworkInterfaces,
    Step::VirtualMachine,
    Step::RoleAssignment,
];

/// Delete order: reverse dependency order, OS disk last
pub const DELETE_ORDER: [Step; 6] = [
    Step::VirtualMachine,
    Step::RoleAssignment,
    Step::NetworkInterfaces,
    Step::InboundNatRule,
    Step::PublicIps,
    Step::OsDisk,
];

/// Direction a step runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Delete,
}

impl Step {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Step::PublicIps => ResourceKind::PublicIp,
            Step::InboundNatRule => ResourceKind::InboundNatRule,
            Step::NetworkInterfaces => ResourceKind::NetworkInterface,
            Step::VirtualMachine => ResourceKind::VirtualMachine,
            Step::RoleAssignment => ResourceKind::RoleAssignment,
            Step::OsDisk => ResourceKind::Disk,
        }
    }

    /// Error context used when the step fails
    pub fn failure_context(&self, phase: Phase) -> String {
        match (phase, self) {
            (Phase::Create, Step::PublicIps) => "unable to create public IPs".to_string(),
            (Phase::Create, Step::InboundNatRule) => {
                "unable to create inbound NAT rule".to_string()
            }
            (Phase::Create, Step::NetworkInterfaces) => {
                "unable to create VM network interface".to_string()
            }
            (Phase::Create, Step::VirtualMachine) => "failed to create VM".to_string(),
            (Phase::Create, Step::RoleAssignment) => {
                "unable to create role assignment".to_string()
            }
            (Phase::Create, Step::OsDisk) => "unable to create OS disk".to_string(),
            (Phase::Delete, step) => format!("failed to delete {}", step),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::PublicIps => write!(f, "public IPs"),
            Step::InboundNatRule => write!(f, "inbound NAT rule"),
            Step::NetworkInterfaces => write!(f, "network interfaces"),
            Step::VirtualMachine => write!(f, "virtual machine"),
            Step::RoleAssignment => write!(f, "role assignment"),
            Step::OsDisk => write!(f, "OS disk"),
        }
    }
}
