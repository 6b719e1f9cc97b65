//! Per-invocation view of a machine or cluster object
//!
//! A scope snapshots the object when the reconcile starts; every change goes
//! to the working copy and [`MachineScope::close`] writes the difference
//! back in one patch, whatever way the reconcile ended.

use crate::error::{ControllerError, Result};
use crate::object::{
    ClusterObject, ClusterPatch, FailureReason, LAST_APPLIED_TAGS_ANNOTATION, MachineObject,
    MachinePatch, ObjectKey,
};
use crate::store::{ObjectStore, SecretStore};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use machineflow_cloud::{ObservedVm, Tags};
use machineflow_cloud_azure::{ClusterContext, MachineSpec};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of the provider id recorded on a machine
pub const PROVIDER_ID_PREFIX: &str = "azure://";

/// Provider id for a VM resource id, `azure:///subscriptions/...`
pub fn provider_id(vm_id: &str) -> String {
    format!("{}/{}", PROVIDER_ID_PREFIX, vm_id.trim_start_matches('/'))
}

/// VM resource id recorded in a provider id
pub fn vm_id_from_provider_id(provider_id: &str) -> Option<&str> {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .filter(|id| id.len() > 1)
}

/// Cluster-wide settings the objects do not carry
#[derive(Debug, Clone, Default)]
pub struct ClusterDefaults {
    /// Used when the cluster object names no subscription
    pub subscription_id: String,
    /// Locations that offer availability zones
    pub zonal_locations: Vec<String>,
}

/// Provider view of a cluster object
pub fn cluster_context(cluster: &ClusterObject, defaults: &ClusterDefaults) -> ClusterContext {
    let subscription_id = cluster
        .spec
        .subscription_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| defaults.subscription_id.clone());
    let zonal = defaults
        .zonal_locations
        .iter()
        .any(|l| l.eq_ignore_ascii_case(&cluster.spec.location));
    ClusterContext {
        name: cluster.metadata.name.clone(),
        subscription_id,
        spec: cluster.spec.clone(),
        zonal,
    }
}

pub struct MachineScope {
    key: ObjectKey,
    original: MachineObject,
    pub machine: MachineObject,
    pub cluster: ClusterObject,
    store: Arc<dyn ObjectStore>,
}

impl MachineScope {
    pub fn new(
        machine: MachineObject,
        cluster: ClusterObject,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            key: machine.metadata.key(),
            original: machine.clone(),
            machine,
            cluster,
            store,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.machine.metadata.name
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.machine.status.failure_reason
    }

    pub fn set_failure(&mut self, reason: FailureReason, message: impl Into<String>) {
        self.machine.status.failure_reason = Some(reason);
        self.machine.status.failure_message = Some(message.into());
        self.machine.status.ready = false;
    }

    /// Non-terminal problem shown to the operator
    pub fn set_failure_message(&mut self, message: impl Into<String>) {
        self.machine.status.failure_message = Some(message.into());
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.machine.status.ready = ready;
        if ready {
            self.machine.status.failure_message = None;
        }
    }

    /// Record what the provider reported about the VM
    pub fn set_vm(&mut self, vm: &ObservedVm) {
        self.machine.spec.provider_id = Some(provider_id(&vm.id));
        self.machine.status.addresses = vm.addresses.clone();
        self.machine.status.vm_state = Some(vm.state.to_string());
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.machine
            .metadata
            .annotations
            .insert(key.to_string(), value.into());
    }

    /// User tags recorded by the previous reconcile; empty when none were
    /// recorded or the annotation does not parse
    pub fn last_applied_tags(&self) -> Tags {
        let Some(raw) = self.machine.metadata.annotation(LAST_APPLIED_TAGS_ANNOTATION) else {
            return Tags::new();
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Tags::from_json(Some(&value)),
            Err(e) => {
                warn!(machine = %self.key, error = %e, "ignoring malformed last applied tags");
                Tags::new()
            }
        }
    }

    pub fn set_last_applied_tags(&mut self, tags: &Tags) {
        self.set_annotation(LAST_APPLIED_TAGS_ANNOTATION, tags.to_json().to_string());
    }

    pub fn vm_id(&self) -> Option<&str> {
        self.machine
            .spec
            .provider_id
            .as_deref()
            .and_then(vm_id_from_provider_id)
    }

    /// Boot data for the VM, base64-encoded; `None` until the bootstrap
    /// secret is named on the machine
    pub async fn bootstrap_data(&self, secrets: &dyn SecretStore) -> Result<Option<String>> {
        let Some(secret) = self.machine.spec.bootstrap_secret.as_deref() else {
            return Ok(None);
        };
        let namespace = &self.machine.metadata.namespace;
        let value = secrets.get_secret(namespace, secret).await?.ok_or_else(|| {
            ControllerError::SecretNotFound {
                namespace: namespace.clone(),
                name: secret.to_string(),
            }
        })?;
        Ok(Some(STANDARD.encode(value)))
    }

    pub fn machine_spec(&self, bootstrap_data: String) -> MachineSpec {
        MachineSpec {
            name: self.machine.metadata.name.clone(),
            role: self.machine.spec.role,
            version: self.machine.spec.version.clone(),
            bootstrap_data,
            spec: self.machine.spec.azure.clone(),
        }
    }

    /// Write back everything changed since the scope was opened
    pub async fn close(self) -> Result<()> {
        let patch = MachinePatch::diff(&self.original, &self.machine);
        if patch.is_empty() {
            return Ok(());
        }
        debug!(machine = %self.key, "patching machine");
        self.store.patch_machine(&self.key, &patch).await
    }
}

pub struct ClusterScope {
    key: ObjectKey,
    original: ClusterObject,
    pub cluster: ClusterObject,
    store: Arc<dyn ObjectStore>,
}

impl ClusterScope {
    pub fn new(cluster: ClusterObject, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            key: cluster.metadata.key(),
            original: cluster.clone(),
            cluster,
            store,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub async fn close(self) -> Result<()> {
        let patch = ClusterPatch::diff(&self.original, &self.cluster);
        if patch.is_empty() {
            return Ok(());
        }
        debug!(cluster = %self.key, "patching cluster");
        self.store.patch_cluster(&self.key, &patch).await
    }
}
