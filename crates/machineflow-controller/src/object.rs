//! Watched objects
//!
//! A machine or cluster object is the only persisted state of the system:
//! the declarative spec the user wrote plus the status the reconcilers
//! report back.

use chrono::{DateTime, Utc};
use machineflow_cloud::VmAddress;
use machineflow_cloud_azure::{AzureClusterSpec, AzureMachineSpec, MachineRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Finalizer guarding the cloud resources of a machine
pub const MACHINE_FINALIZER: &str = "azuremachine.infrastructure.cluster.x-k8s.io";

/// Finalizer guarding the cloud resources of a cluster
pub const CLUSTER_FINALIZER: &str = "azurecluster.infrastructure.cluster.x-k8s.io";

/// Set on machines whose VM exists, naming the provider that made it
pub const PROVIDER_ANNOTATION: &str = "cluster-api-provider-azure";

/// JSON map of the user tags the last reconcile put on the VM
pub const LAST_APPLIED_TAGS_ANNOTATION: &str =
    "sigs.k8s.io/cluster-api-provider-azure-last-applied-tags-azuremachine";

/// Namespace and name of a watched object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Set when deletion was requested; the object goes away once its
    /// finalizers are removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Why a machine stopped being reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    InvalidConfiguration,
    CreateMachineError,
    UpdateMachineError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            FailureReason::CreateMachineError => write!(f, "CreateError"),
            FailureReason::UpdateMachineError => write!(f, "UpdateError"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineObjectSpec {
    pub cluster_name: String,
    #[serde(default)]
    pub role: MachineRole,
    /// Kubernetes version, used for the default image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Secret holding the boot data; absent until the bootstrap provider
    /// produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_secret: Option<String>,
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(flatten)]
    pub azure: AzureMachineSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_state: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<VmAddress>,
    /// Terminal problem; reconciliation stops until it is cleared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Consecutive failed provisioning attempts recovered by recreating the VM
    #[serde(default)]
    pub provisioning_recoveries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineObject {
    pub metadata: ObjectMeta,
    pub spec: MachineObjectSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterObject {
    pub metadata: ObjectMeta,
    pub spec: AzureClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

/// Changed fields of a machine object; `None` means unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachinePatch {
    pub finalizers: Option<Vec<String>>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub provider_id: Option<Option<String>>,
    pub status: Option<MachineStatus>,
}

impl MachinePatch {
    /// Fields of `current` that differ from `original`
    pub fn diff(original: &MachineObject, current: &MachineObject) -> Self {
        Self {
            finalizers: (original.metadata.finalizers != current.metadata.finalizers)
                .then(|| current.metadata.finalizers.clone()),
            annotations: (original.metadata.annotations != current.metadata.annotations)
                .then(|| current.metadata.annotations.clone()),
            provider_id: (original.spec.provider_id != current.spec.provider_id)
                .then(|| current.spec.provider_id.clone()),
            status: (original.status != current.status).then(|| current.status.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_none()
            && self.annotations.is_none()
            && self.provider_id.is_none()
            && self.status.is_none()
    }

    pub fn apply(&self, machine: &mut MachineObject) {
        if let Some(finalizers) = &self.finalizers {
            machine.metadata.finalizers = finalizers.clone();
        }
        if let Some(annotations) = &self.annotations {
            machine.metadata.annotations = annotations.clone();
        }
        if let Some(provider_id) = &self.provider_id {
            machine.spec.provider_id = provider_id.clone();
        }
        if let Some(status) = &self.status {
            machine.status = status.clone();
        }
    }
}

/// Changed fields of a cluster object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterPatch {
    pub finalizers: Option<Vec<String>>,
    pub status: Option<ClusterStatus>,
}

impl ClusterPatch {
    pub fn diff(original: &ClusterObject, current: &ClusterObject) -> Self {
        Self {
            finalizers: (original.metadata.finalizers != current.metadata.finalizers)
                .then(|| current.metadata.finalizers.clone()),
            status: (original.status != current.status).then(|| current.status.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_none() && self.status.is_none()
    }

    pub fn apply(&self, cluster: &mut ClusterObject) {
        if let Some(finalizers) = &self.finalizers {
            cluster.metadata.finalizers = finalizers.clone();
        }
        if let Some(status) = &self.status {
            cluster.status = status.clone();
        }
    }
}
