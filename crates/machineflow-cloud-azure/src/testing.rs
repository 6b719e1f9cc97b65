//! In-memory ARM for tests
//!
//! [`FakeArm`] stores PUT bodies keyed by resource id, records every call in
//! order and fills in what the provider would (ids, provisioning states,
//! addresses, identity principals, the implicit OS disk of a VM). It refuses
//! what ARM refuses: child resources under a missing parent, and deleting a
//! disk or NIC a VM still holds. Deletes finish at once unless
//! [`FakeArm::set_async_deletes`] is on. Failures can be injected per method
//! and id fragment.

use crate::arm::{ArmApi, NETWORK_NAMESPACE, ResourceId};
use crate::cluster::ClusterService;
use crate::names;
use crate::spec::{
    AzureClusterSpec, AzureMachineSpec, ClusterContext, MachineRole, MachineSpec, ManagedDisk,
    NetworkSpec, OsDisk,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use machineflow_cloud::{CloudError, Result};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

pub const TEST_SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000001";
pub const TEST_CLUSTER: &str = "demo";
pub const TEST_RESOURCE_GROUP: &str = "demo-rg";
pub const TEST_LOCATION: &str = "eastus";
pub const TEST_API_SERVER_LB: &str = "demo-public-lb";
pub const TEST_NODE_OUTBOUND_LB: &str = "demo";
pub const TEST_SSH_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7 test@example";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Patch,
    Delete,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: Method,
    pub path: String,
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self.method, Method::Put | Method::Patch | Method::Delete)
    }
}

type ErrorFactory = Box<dyn Fn() -> CloudError + Send>;

struct Failure {
    method: Method,
    fragment: String,
    make: ErrorFactory,
}

struct FakeState {
    resources: BTreeMap<String, Value>,
    calls: Vec<Call>,
    skus: Vec<Value>,
    failures: Vec<Failure>,
    vm_state: String,
    next_address: u32,
    /// Reads a deleted resource stays visible for; `None` deletes at once
    async_deletes: Option<u32>,
    /// Resources being deleted and the reads left before they disappear
    deleting: BTreeMap<String, u32>,
}

pub struct FakeArm {
    state: Mutex<FakeState>,
}

impl Default for FakeArm {
    fn default() -> Self {
        Self::new()
    }
}

fn key(id: &str) -> String {
    id.trim_end_matches('/').to_lowercase()
}

/// Parent of a child resource (`.../loadBalancers/lb/inboundNatRules/r`) or
/// child collection (`.../loadBalancers/lb/inboundNatRules`)
fn parent_key(k: &str) -> Option<String> {
    let (scope, rest) = k.rsplit_once("/providers/")?;
    let segments: Vec<&str> = rest.split('/').collect();
    // namespace, type, name, child type[, child name]
    let keep = match segments.len() {
        4 => 3,
        n if n >= 5 && n % 2 == 1 => n - 2,
        _ => return None,
    };
    Some(format!("{}/providers/{}", scope, segments[..keep].join("/")))
}

fn conflict(message: String) -> CloudError {
    CloudError::Api(format!("ARM returned 409 (OperationNotAllowed): {}", message))
}

impl FakeArm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                resources: BTreeMap::new(),
                calls: Vec::new(),
                skus: Vec::new(),
                failures: Vec::new(),
                vm_state: "Succeeded".to_string(),
                next_address: 0,
                async_deletes: None,
                deleting: BTreeMap::new(),
            }),
        }
    }

    /// Fake holding the cluster infrastructure as [`ClusterService`] creates
    /// it, plus a zonal `Standard_D2s_v3` catalog entry. Calls made while
    /// seeding are cleared.
    pub async fn with_cluster(cluster: &ClusterContext) -> Result<Arc<Self>> {
        let arm = Arc::new(Self::new());
        ClusterService::new(arm.clone(), Arc::new(cluster.clone()))
            .reconcile(&CancellationToken::new())
            .await?;
        arm.add_sku(sku(
            "Standard_D2s_v3",
            cluster.location(),
            &["1", "2", "3"],
            true,
        ));
        arm.clear_calls();
        Ok(arm)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a resource as if it already existed at the provider
    pub fn insert(&self, id: &ResourceId, mut value: Value) {
        value["id"] = json!(id.as_str());
        value["name"] = json!(id.name());
        self.state().resources.insert(key(id.as_str()), value);
    }

    pub fn resource(&self, id: &ResourceId) -> Option<Value> {
        self.state().resources.get(&key(id.as_str())).cloned()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.state().resources.contains_key(&key(id.as_str()))
    }

    /// Provisioning state reported for VMs created from now on
    pub fn set_vm_state(&self, state: &str) {
        self.state().vm_state = state.to_string();
    }

    /// Overwrite the provisioning state of a stored resource
    pub fn set_provisioning_state(&self, id: &ResourceId, state: &str) {
        if let Some(value) = self.state().resources.get_mut(&key(id.as_str())) {
            value["properties"]["provisioningState"] = json!(state);
        }
    }

    /// Deletes accepted from now on leave the resource in `Deleting` for
    /// `reads` more GETs; the read after that reports it gone
    pub fn set_async_deletes(&self, reads: u32) {
        self.state().async_deletes = Some(reads);
    }

    pub fn add_sku(&self, sku: Value) {
        self.state().skus.push(sku);
    }

    /// Fail every `method` call whose path contains `fragment`
    /// (case-insensitive) with the error built by `make`
    pub fn fail<F>(&self, method: Method, fragment: &str, make: F)
    where
        F: Fn() -> CloudError + Send + 'static,
    {
        self.state().failures.push(Failure {
            method,
            fragment: fragment.to_lowercase(),
            make: Box::new(make),
        });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Position of the first `method` call whose path contains `fragment`
    pub fn position(&self, method: Method, fragment: &str) -> Option<usize> {
        let fragment = fragment.to_lowercase();
        self.state()
            .calls
            .iter()
            .position(|c| c.method == method && c.path.to_lowercase().contains(&fragment))
    }

    pub fn count(&self, method: Method, fragment: &str) -> usize {
        let fragment = fragment.to_lowercase();
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path.to_lowercase().contains(&fragment))
            .count()
    }
}

impl FakeState {
    fn record(&mut self, method: Method, path: &str) -> Result<()> {
        self.calls.push(Call {
            method,
            path: path.to_string(),
        });
        let lower = path.to_lowercase();
        match self
            .failures
            .iter()
            .find(|f| f.method == method && lower.contains(&f.fragment))
        {
            Some(failure) => Err((failure.make)()),
            None => Ok(()),
        }
    }

    fn require_parent(&self, path: &str) -> Result<()> {
        match parent_key(&key(path)) {
            Some(parent) if !self.resources.contains_key(&parent) => Err(CloudError::NotFound(
                format!("parent resource of {} not found", path),
            )),
            _ => Ok(()),
        }
    }

    fn remove(&mut self, k: &str) {
        self.resources.remove(k);
        self.deleting.remove(k);
        let prefix = format!("{}/", k);
        self.resources.retain(|name, _| !name.starts_with(&prefix));
    }

    /// Name of a stored VM that still holds the disk or NIC under `k`
    fn holder(&self, k: &str) -> Option<String> {
        let (scope, _) = k.split_once("/providers/")?;
        let is_disk = k.contains("/microsoft.compute/disks/");
        let is_nic = k.contains("/microsoft.network/networkinterfaces/");
        if !is_disk && !is_nic {
            return None;
        }
        let name = k.rsplit('/').next()?;
        let vm_prefix = format!("{}/providers/microsoft.compute/virtualmachines/", scope);

        self.resources
            .iter()
            .filter(|(vm_key, _)| {
                vm_key
                    .strip_prefix(&vm_prefix)
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .find(|(_, vm)| {
                if is_disk {
                    vm.pointer("/properties/storageProfile/osDisk/name")
                        .and_then(Value::as_str)
                        .is_some_and(|disk| disk.eq_ignore_ascii_case(name))
                } else {
                    vm.pointer("/properties/networkProfile/networkInterfaces")
                        .and_then(Value::as_array)
                        .is_some_and(|nics| {
                            nics.iter()
                                .filter_map(|nic| nic.get("id").and_then(Value::as_str))
                                .any(|id| key(id) == k)
                        })
                }
            })
            .and_then(|(_, vm)| vm.get("name").and_then(Value::as_str).map(str::to_string))
    }

    fn next_address(&mut self, prefix: &str) -> String {
        self.next_address += 1;
        format!("{}.{}", prefix, 3 + self.next_address)
    }

    fn materialize(&mut self, id: &ResourceId, body: &Value) -> Value {
        let mut value = body.clone();
        value["id"] = json!(id.as_str());
        value["name"] = json!(id.name());
        if !value.get("properties").is_some_and(Value::is_object) {
            value["properties"] = json!({});
        }

        let lower = id.as_str().to_lowercase();
        let is_vm = lower.contains("/virtualmachines/");
        let state = if is_vm {
            self.vm_state.clone()
        } else {
            "Succeeded".to_string()
        };
        value["properties"]["provisioningState"] = json!(state);

        if is_vm && value.pointer("/identity/type") == Some(&json!("SystemAssigned")) {
            value["identity"]["principalId"] = json!(format!("principal-{}", id.name()));
        }
        if lower.contains("/networkinterfaces/") {
            let mut assigned = Vec::new();
            if let Some(configs) = value
                .pointer("/properties/ipConfigurations")
                .and_then(Value::as_array)
            {
                for (i, config) in configs.iter().enumerate() {
                    if config.pointer("/properties/privateIPAddress").is_none() {
                        assigned.push(i);
                    }
                }
            }
            for i in assigned {
                let address = self.next_address("10.0.0");
                value["properties"]["ipConfigurations"][i]["properties"]["privateIPAddress"] =
                    json!(address);
            }
        }
        if lower.contains("/publicipaddresses/") {
            value["properties"]["ipAddress"] = json!(self.next_address("20.0.0"));
        }
        value
    }

    /// The OS disk the provider creates along with a VM
    fn create_os_disk(&mut self, vm_id: &ResourceId, vm: &Value) {
        let Some(disk) = vm
            .pointer("/properties/storageProfile/osDisk/name")
            .and_then(Value::as_str)
        else {
            return;
        };
        let Some((scope, _)) = vm_id.as_str().split_once("/providers/") else {
            return;
        };
        let id = ResourceId::parse(scope).provider("Microsoft.Compute", "disks", disk);
        let value = json!({
            "id": id.as_str(),
            "name": disk,
            "properties": { "provisioningState": "Succeeded" },
        });
        self.deleting.remove(&key(id.as_str()));
        self.resources.insert(key(id.as_str()), value);
    }
}

#[async_trait]
impl ArmApi for FakeArm {
    async fn get(&self, id: &ResourceId, _api_version: &str) -> Result<Value> {
        let mut state = self.state();
        state.record(Method::Get, id.as_str())?;
        let k = key(id.as_str());
        match state.deleting.get(&k).copied() {
            Some(0) => {
                state.remove(&k);
                return Err(CloudError::NotFound(id.to_string()));
            }
            Some(reads) => {
                state.deleting.insert(k.clone(), reads - 1);
            }
            None => {}
        }
        state
            .resources
            .get(&k)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    async fn put(&self, id: &ResourceId, _api_version: &str, body: &Value) -> Result<Value> {
        let mut state = self.state();
        state.record(Method::Put, id.as_str())?;
        state.require_parent(id.as_str())?;
        let value = state.materialize(id, body);
        if id.as_str().to_lowercase().contains("/virtualmachines/") {
            state.create_os_disk(id, &value);
        }
        state.deleting.remove(&key(id.as_str()));
        state.resources.insert(key(id.as_str()), value.clone());
        Ok(value)
    }

    async fn patch(&self, id: &ResourceId, _api_version: &str, body: &Value) -> Result<Value> {
        let mut state = self.state();
        state.record(Method::Patch, id.as_str())?;
        let stored = state
            .resources
            .get_mut(&key(id.as_str()))
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        if let Some(fields) = body.as_object() {
            for (field, value) in fields {
                stored[field.as_str()] = value.clone();
            }
        }
        Ok(stored.clone())
    }

    async fn delete(&self, id: &ResourceId, _api_version: &str) -> Result<()> {
        let mut state = self.state();
        state.record(Method::Delete, id.as_str())?;
        let k = key(id.as_str());
        if !state.resources.contains_key(&k) {
            return Err(CloudError::NotFound(id.to_string()));
        }
        if state.deleting.contains_key(&k) {
            return Ok(());
        }
        if let Some(vm) = state.holder(&k) {
            return Err(conflict(format!(
                "{} is attached to VM {}",
                id.name(),
                vm
            )));
        }

        match state.async_deletes {
            Some(reads) => {
                if let Some(value) = state.resources.get_mut(&k) {
                    value["properties"]["provisioningState"] = json!("Deleting");
                }
                state.deleting.insert(k, reads);
            }
            None => state.remove(&k),
        }
        Ok(())
    }

    async fn list(
        &self,
        path: &str,
        _api_version: &str,
        _filter: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut state = self.state();
        state.record(Method::List, path)?;
        let k = key(path);
        if k.ends_with("/skus") {
            return Ok(state.skus.clone());
        }
        state.require_parent(path)?;
        let prefix = format!("{}/", k);
        Ok(state
            .resources
            .iter()
            .filter(|(name, _)| {
                name.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .map(|(_, value)| value.clone())
            .collect())
    }
}

/// Catalog entry for a virtual-machine size
pub fn sku(name: &str, location: &str, zones: &[&str], accelerated: bool) -> Value {
    let accelerated = if accelerated { "True" } else { "False" };
    json!({
        "name": name,
        "resourceType": "virtualMachines",
        "locationInfo": [{ "location": location, "zones": zones }],
        "capabilities": [
            { "name": "vCPUs", "value": "2" },
            { "name": "AcceleratedNetworkingEnabled", "value": accelerated },
        ],
    })
}

pub fn cluster_context() -> ClusterContext {
    ClusterContext {
        name: TEST_CLUSTER.to_string(),
        subscription_id: TEST_SUBSCRIPTION.to_string(),
        spec: AzureClusterSpec {
            resource_group: TEST_RESOURCE_GROUP.to_string(),
            location: TEST_LOCATION.to_string(),
            subscription_id: None,
            network_spec: NetworkSpec {
                api_server_lb: Some(TEST_API_SERVER_LB.to_string()),
                node_outbound_lb: Some(TEST_NODE_OUTBOUND_LB.to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
        zonal: true,
    }
}

pub fn azure_machine_spec() -> AzureMachineSpec {
    AzureMachineSpec {
        vm_size: "Standard_D2s_v3".to_string(),
        os_disk: OsDisk {
            os_type: "Linux".to_string(),
            disk_size_gb: 30,
            managed_disk: ManagedDisk {
                storage_account_type: "Premium_LRS".to_string(),
            },
            caching_type: None,
        },
        ssh_public_key: STANDARD.encode(TEST_SSH_KEY),
        ..Default::default()
    }
}

pub fn machine_spec(name: &str, role: MachineRole) -> MachineSpec {
    MachineSpec {
        name: name.to_string(),
        role,
        version: Some("v1.18.2".to_string()),
        bootstrap_data: STANDARD.encode("#cloud-config\n"),
        spec: azure_machine_spec(),
    }
}

/// Id of the machine's primary network interface in the test cluster
pub fn nic_id(cluster: &ClusterContext, machine: &str) -> ResourceId {
    cluster.resource_id(NETWORK_NAMESPACE, "networkInterfaces", &names::nic_name(machine))
}
