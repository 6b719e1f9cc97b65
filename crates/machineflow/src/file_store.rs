//! YAML files as the object store
//!
//! ```text
//! <root>/<namespace>/machines/<name>.yaml
//! <root>/<namespace>/clusters/<name>.yaml
//! <root>/<namespace>/secrets/<name>
//! ```

use async_trait::async_trait;
use chrono::Utc;
use machineflow_controller::{
    ClusterObject, ClusterPatch, ControllerError, MachineObject, MachinePatch, ObjectKey,
    ObjectStore, Result, SecretStore,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const MACHINES: &str = "machines";
const CLUSTERS: &str = "clusters";
const SECRETS: &str = "secrets";

fn store_error(path: &Path, err: impl std::fmt::Display) -> ControllerError {
    ControllerError::Store(format!("{}: {}", path.display(), err))
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, kind: &str, key: &ObjectKey) -> PathBuf {
        self.root
            .join(&key.namespace)
            .join(kind)
            .join(format!("{}.yaml", key.name))
    }

    fn read<T: DeserializeOwned>(&self, kind: &str, key: &ObjectKey) -> Result<Option<T>> {
        let path = self.object_path(kind, key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| store_error(&path, e))?;
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| store_error(&path, e))?;
        // The file location is authoritative for name and namespace
        if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_mapping_mut()) {
            metadata.insert("name".into(), key.name.clone().into());
            metadata.insert("namespace".into(), key.namespace.clone().into());
        }
        serde_yaml::from_value(value)
            .map(Some)
            .map_err(|e| store_error(&path, e))
    }

    fn write<T: Serialize>(&self, kind: &str, key: &ObjectKey, object: &T) -> Result<()> {
        let path = self.object_path(kind, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| store_error(parent, e))?;
        }
        let content = serde_yaml::to_string(object).map_err(|e| store_error(&path, e))?;
        std::fs::write(&path, content).map_err(|e| store_error(&path, e))
    }

    fn remove(&self, kind: &str, key: &ObjectKey) -> Result<()> {
        let path = self.object_path(kind, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&path, e)),
        }
    }

    /// Request deletion of a machine; `false` when it does not exist
    pub fn mark_machine_deleted(&self, key: &ObjectKey) -> Result<bool> {
        let Some(mut machine) = self.read::<MachineObject>(MACHINES, key)? else {
            return Ok(false);
        };
        if machine.metadata.deletion_timestamp.is_none() {
            machine.metadata.deletion_timestamp = Some(Utc::now());
            self.write(MACHINES, key, &machine)?;
        }
        Ok(true)
    }

    /// Request deletion of a cluster; `false` when it does not exist
    pub fn mark_cluster_deleted(&self, key: &ObjectKey) -> Result<bool> {
        let Some(mut cluster) = self.read::<ClusterObject>(CLUSTERS, key)? else {
            return Ok(false);
        };
        if cluster.metadata.deletion_timestamp.is_none() {
            cluster.metadata.deletion_timestamp = Some(Utc::now());
            self.write(CLUSTERS, key, &cluster)?;
        }
        Ok(true)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn get_machine(&self, key: &ObjectKey) -> Result<Option<MachineObject>> {
        self.read(MACHINES, key)
    }

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<ClusterObject>> {
        self.read(CLUSTERS, key)
    }

    async fn patch_machine(&self, key: &ObjectKey, patch: &MachinePatch) -> Result<()> {
        let mut machine: MachineObject = self
            .read(MACHINES, key)?
            .ok_or_else(|| ControllerError::Store(format!("machine {} not found", key)))?;
        patch.apply(&mut machine);
        if machine.metadata.is_deleting() && machine.metadata.finalizers.is_empty() {
            return self.remove(MACHINES, key);
        }
        self.write(MACHINES, key, &machine)
    }

    async fn patch_cluster(&self, key: &ObjectKey, patch: &ClusterPatch) -> Result<()> {
        let mut cluster: ClusterObject = self
            .read(CLUSTERS, key)?
            .ok_or_else(|| ControllerError::Store(format!("cluster {} not found", key)))?;
        patch.apply(&mut cluster);
        if cluster.metadata.is_deleting() && cluster.metadata.finalizers.is_empty() {
            return self.remove(CLUSTERS, key);
        }
        self.write(CLUSTERS, key, &cluster)
    }
}

#[async_trait]
impl SecretStore for FileStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(namespace).join(SECRETS).join(name);
        match std::fs::read(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machineflow_controller::object::MACHINE_FINALIZER;
    use machineflow_controller::object::MachineStatus;
    use std::fs;

    const MACHINE_YAML: &str = r#"
metadata:
  name: ignored
spec:
  clusterName: demo
  bootstrapSecret: m1-bootstrap
  vmSize: Standard_D2s_v3
  osDisk:
    osType: Linux
    diskSizeGB: 30
    managedDisk:
      storageAccountType: Premium_LRS
  sshPublicKey: c3NoLXJzYQ==
"#;

    fn setup() -> (tempfile::TempDir, FileStore, ObjectKey) {
        let dir = tempfile::tempdir().unwrap();
        let machines = dir.path().join("default").join("machines");
        fs::create_dir_all(&machines).unwrap();
        fs::write(machines.join("m1.yaml"), MACHINE_YAML).unwrap();
        let store = FileStore::new(dir.path());
        (dir, store, ObjectKey::new("default", "m1"))
    }

    #[tokio::test]
    async fn test_read_uses_file_location() {
        let (_dir, store, key) = setup();
        let machine = store.get_machine(&key).await.unwrap().unwrap();
        assert_eq!(machine.metadata.name, "m1");
        assert_eq!(machine.metadata.namespace, "default");
        assert_eq!(machine.spec.cluster_name, "demo");

        let missing = ObjectKey::new("default", "m2");
        assert!(store.get_machine(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_is_persisted() {
        let (_dir, store, key) = setup();
        let patch = MachinePatch {
            finalizers: Some(vec![MACHINE_FINALIZER.to_string()]),
            status: Some(MachineStatus {
                ready: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        store.patch_machine(&key, &patch).await.unwrap();

        let machine = store.get_machine(&key).await.unwrap().unwrap();
        assert!(machine.status.ready);
        assert!(machine.metadata.has_finalizer(MACHINE_FINALIZER));
        // Spec survives the round trip through the file
        assert_eq!(machine.spec.azure.vm_size, "Standard_D2s_v3");
    }

    #[tokio::test]
    async fn test_deleted_machine_file_goes_away() {
        let (dir, store, key) = setup();
        assert!(store.mark_machine_deleted(&key).unwrap());

        store
            .patch_machine(
                &key,
                &MachinePatch {
                    finalizers: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!dir.path().join("default/machines/m1.yaml").exists());
        assert!(!store.mark_machine_deleted(&key).unwrap());
    }

    #[tokio::test]
    async fn test_secrets_are_raw_bytes() {
        let (dir, store, _) = setup();
        let secrets = dir.path().join("default").join("secrets");
        fs::create_dir_all(&secrets).unwrap();
        fs::write(secrets.join("m1-bootstrap"), b"#cloud-config\n").unwrap();

        let value = store.get_secret("default", "m1-bootstrap").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"#cloud-config\n"[..]));
        assert!(store.get_secret("default", "other").await.unwrap().is_none());
    }
}
