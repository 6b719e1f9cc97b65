//! Azure provider for MachineFlow
//!
//! Drives Azure Resource Manager through a generic [`ArmApi`] client. Each
//! resource type gets its own adapter under [`services`]; [`MachineService`]
//! and [`ClusterService`] sequence them.

pub mod arm;
pub mod cluster;
pub mod error;
pub mod machine;
pub mod names;
pub mod services;
pub mod spec;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use arm::{ArmApi, ArmClient, DEFAULT_ARM_ENDPOINT, ResourceId};
pub use cluster::ClusterService;
pub use error::AzureError;
pub use machine::MachineService;
pub use services::resourceskus::SkuCatalogClient;
pub use spec::{
    AzureClusterSpec, AzureMachineSpec, ClusterContext, MachineRole, MachineSpec, VmIdentity,
};
