//! Access to watched objects and their secrets
//!
//! Reconcilers read an object once per invocation and write back a single
//! patch holding only the fields they changed.

use crate::error::{ControllerError, Result};
use crate::object::{ClusterObject, ClusterPatch, MachineObject, MachinePatch, ObjectKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `None` when the object no longer exists
    async fn get_machine(&self, key: &ObjectKey) -> Result<Option<MachineObject>>;

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<ClusterObject>>;

    async fn patch_machine(&self, key: &ObjectKey, patch: &MachinePatch) -> Result<()>;

    async fn patch_cluster(&self, key: &ObjectKey, patch: &ClusterPatch) -> Result<()>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Value of a secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>>;
}

/// In-process store; objects being deleted vanish once their last
/// finalizer is patched away
#[derive(Default)]
pub struct MemoryStore {
    machines: Mutex<HashMap<ObjectKey, MachineObject>>,
    clusters: Mutex<HashMap<ObjectKey, ClusterObject>>,
    secrets: Mutex<HashMap<(String, String), Vec<u8>>>,
    patches: Mutex<Vec<ObjectKey>>,
}

fn poisoned<T>(_: T) -> ControllerError {
    ControllerError::Store("store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_machine(&self, machine: MachineObject) {
        if let Ok(mut machines) = self.machines.lock() {
            machines.insert(machine.metadata.key(), machine);
        }
    }

    pub fn put_cluster(&self, cluster: ClusterObject) {
        if let Ok(mut clusters) = self.clusters.lock() {
            clusters.insert(cluster.metadata.key(), cluster);
        }
    }

    pub fn put_secret(&self, namespace: &str, name: &str, value: impl Into<Vec<u8>>) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.insert((namespace.to_string(), name.to_string()), value.into());
        }
    }

    pub fn machine(&self, key: &ObjectKey) -> Option<MachineObject> {
        self.machines.lock().ok()?.get(key).cloned()
    }

    pub fn cluster(&self, key: &ObjectKey) -> Option<ClusterObject> {
        self.clusters.lock().ok()?.get(key).cloned()
    }

    /// Keys of every patch written so far, in order
    pub fn patches(&self) -> Vec<ObjectKey> {
        self.patches
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn record(&self, key: &ObjectKey) -> Result<()> {
        self.patches.lock().map_err(poisoned)?.push(key.clone());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_machine(&self, key: &ObjectKey) -> Result<Option<MachineObject>> {
        Ok(self.machines.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<ClusterObject>> {
        Ok(self.clusters.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn patch_machine(&self, key: &ObjectKey, patch: &MachinePatch) -> Result<()> {
        {
            let mut machines = self.machines.lock().map_err(poisoned)?;
            let machine = machines
                .get_mut(key)
                .ok_or_else(|| ControllerError::Store(format!("machine {} not found", key)))?;
            patch.apply(machine);
            if machine.metadata.is_deleting() && machine.metadata.finalizers.is_empty() {
                machines.remove(key);
            }
        }
        self.record(key)
    }

    async fn patch_cluster(&self, key: &ObjectKey, patch: &ClusterPatch) -> Result<()> {
        {
            let mut clusters = self.clusters.lock().map_err(poisoned)?;
            let cluster = clusters
                .get_mut(key)
                .ok_or_else(|| ControllerError::Store(format!("cluster {} not found", key)))?;
            patch.apply(cluster);
            if cluster.metadata.is_deleting() && cluster.metadata.finalizers.is_empty() {
                clusters.remove(key);
            }
        }
        self.record(key)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .secrets
            .lock()
            .map_err(poisoned)?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
