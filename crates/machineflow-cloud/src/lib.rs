//! MachineFlow Cloud Convergence
//!
//! Provider-neutral building blocks for converging a declared machine and its
//! dependent resources onto a cloud provider.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              machineflow-controller              │
//! │        (status, events, once-per-exit patch)     │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │             machineflow-cloud-azure              │
//! │   MachineService / ClusterService orchestrators  │
//! │   one ResourceReconciler per resource type       │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                machineflow-cloud                 │
//! │  ┌──────────────┐ ┌──────────────┐ ┌─────────┐  │
//! │  │ State machine│ │ Capabilities │ │  Tags   │  │
//! │  │              │ │ + zones      │ │ (guard) │  │
//! │  └──────────────┘ └──────────────┘ └─────────┘  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate keeps state between reconciliations except the
//! [`CapabilityCache`], which only holds provider catalog data.

pub mod capability;
pub mod error;
pub mod reconciler;
pub mod state;
pub mod step;
pub mod tags;
pub mod zones;

// Re-exports
pub use capability::{CapabilityCache, CatalogClient, SizeCapabilities, Sku};
pub use error::{CloudError, Result, ResultExt};
pub use reconciler::{ResourceKind, ResourceReconciler};
pub use state::{AddressKind, ObservedVm, ProvisioningState, VmAddress, VmTransition};
pub use step::{CREATE_ORDER, DELETE_ORDER, Phase, Step};
pub use tags::{BuildParams, ResourceLifecycle, TagChanges, Tags, is_managed};
pub use zones::{requested_zone, select_zone};
