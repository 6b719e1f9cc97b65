//! Machine orchestrator
//!
//! Converges one machine and its dependent resources in dependency order and
//! tears them down in reverse. Each step must succeed before the next one
//! starts; nothing already created is rolled back on failure, the next
//! reconcile picks up where this one stopped.

use crate::arm::{ArmApi, NETWORK_NAMESPACE, ResourceId};
use crate::names;
use crate::services::disks::{DiskService, DiskSpec};
use crate::services::inboundnatrules::{InboundNatRuleService, InboundNatRuleSpec};
use crate::services::networkinterfaces::{NetworkInterfaceService, NetworkInterfaceSpec};
use crate::services::publicips::{PublicIpService, PublicIpSpec};
use crate::services::roleassignments::{RoleAssignmentService, RoleAssignmentSpec};
use crate::services::virtualmachines::{VirtualMachineService, VmSpec};
use crate::spec::{ClusterContext, MachineRole, MachineSpec, VmIdentity, default_ubuntu_image};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use machineflow_cloud::{
    CREATE_ORDER, CapabilityCache, CloudError, DELETE_ORDER, ObservedVm, Phase,
    ResourceReconciler, Result, ResultExt, Step, TagChanges, Tags, VmTransition, requested_zone,
    select_zone,
};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run one provider interaction, giving up as soon as `cancel` fires
pub(crate) async fn guarded<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CloudError::Cancelled),
        result = operation => result,
    }
}

fn step_error(err: CloudError, step: Step, phase: Phase) -> CloudError {
    if err.is_cancelled() {
        err
    } else {
        err.wrap(step.failure_context(phase))
    }
}

pub struct MachineService {
    cluster: Arc<ClusterContext>,
    machine: MachineSpec,
    capabilities: Arc<CapabilityCache>,
    public_ips: PublicIpService,
    inbound_nat_rules: InboundNatRuleService,
    network_interfaces: NetworkInterfaceService,
    virtual_machines: VirtualMachineService,
    disks: DiskService,
    role_assignments: RoleAssignmentService,
}

impl MachineService {
    pub fn new(
        arm: Arc<dyn ArmApi>,
        cluster: Arc<ClusterContext>,
        machine: MachineSpec,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        Self {
            public_ips: PublicIpService::new(arm.clone(), cluster.clone()),
            inbound_nat_rules: InboundNatRuleService::new(arm.clone(), cluster.clone()),
            network_interfaces: NetworkInterfaceService::new(
                arm.clone(),
                cluster.clone(),
                capabilities.clone(),
            ),
            virtual_machines: VirtualMachineService::new(arm.clone(), cluster.clone()),
            disks: DiskService::new(arm.clone(), cluster.clone()),
            role_assignments: RoleAssignmentService::new(arm, cluster.clone()),
            cluster,
            machine,
            capabilities,
        }
    }

    pub fn machine(&self) -> &MachineSpec {
        &self.machine
    }

    /// Create whatever is missing and report the VM as the provider sees it
    ///
    /// A VM whose provisioning failed is deleted together with its OS disk and
    /// a retryable [`CloudError::ProvisioningFailed`] is returned so the caller
    /// re-invokes this later to create it afresh.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ObservedVm> {
        let mut observed = None;
        for step in CREATE_ORDER {
            debug!(machine = %self.machine.name, %step, "reconciling");
            let result = match step {
                Step::PublicIps => guarded(cancel, self.reconcile_public_ips()).await,
                Step::InboundNatRule => guarded(cancel, self.reconcile_nat_rule()).await,
                Step::NetworkInterfaces => {
                    guarded(cancel, self.reconcile_network_interfaces()).await
                }
                Step::VirtualMachine => guarded(cancel, self.reconcile_virtual_machine())
                    .await
                    .map(|vm| observed = Some(vm)),
                Step::RoleAssignment => {
                    guarded(cancel, self.reconcile_role_assignment(observed.as_ref())).await
                }
                Step::OsDisk => Ok(()),
            };
            result.map_err(|e| step_error(e, step, Phase::Create))?;
        }

        observed.ok_or_else(|| {
            CloudError::Api(format!(
                "virtual machine {} was not observed",
                self.machine.name
            ))
        })
    }

    /// Delete the VM and everything created for it; resources already gone
    /// are skipped, resources not owned by the cluster are left alone
    ///
    /// The VM must be gone before its NICs and OS disk can go, so a VM the
    /// provider is still deleting is waited out.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        for step in DELETE_ORDER {
            debug!(machine = %self.machine.name, %step, "deleting");
            let result = match step {
                Step::VirtualMachine => guarded(cancel, self.delete_virtual_machine()).await,
                Step::RoleAssignment => guarded(cancel, self.delete_role_assignment()).await,
                Step::NetworkInterfaces => {
                    guarded(cancel, self.delete_network_interfaces()).await
                }
                Step::InboundNatRule => guarded(cancel, self.delete_nat_rule()).await,
                Step::PublicIps => guarded(cancel, self.delete_public_ips()).await,
                Step::OsDisk => guarded(cancel, self.disks.delete(&self.os_disk_spec())).await,
            };
            result.map_err(|e| step_error(e, step, Phase::Delete))?;
        }
        info!(machine = %self.machine.name, "machine resources deleted");
        Ok(())
    }

    /// Look up the VM recorded for this machine; `None` when nothing was
    /// recorded yet or the provider no longer knows it
    pub async fn vm_if_exists(&self, vm_id: Option<&str>) -> Result<Option<ObservedVm>> {
        let Some(vm_id) = vm_id.filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        let id = ResourceId::parse(vm_id);
        match self.virtual_machines.get(id.name()).await {
            Ok(vm) => Ok(Some(vm)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).context(|| format!("failed to get VM {}", id.name())),
        }
    }

    /// User tags the VM should carry: cluster tags overlaid with the
    /// machine's own
    pub fn additional_tags(&self) -> Tags {
        let mut tags = self.cluster.additional_tags().clone();
        tags.merge(&self.machine.spec.additional_tags);
        tags
    }

    /// Converge the user tags of an existing VM. `last_applied` is what the
    /// previous reconcile set; keys dropped from it since are removed. The
    /// desired set is returned for the caller to record.
    pub async fn reconcile_tags(
        &self,
        last_applied: &Tags,
        cancel: &CancellationToken,
    ) -> Result<Tags> {
        let desired = self.additional_tags();
        let changes = TagChanges::between(last_applied, &desired);
        guarded(
            cancel,
            self.virtual_machines.update_tags(&self.machine.name, &changes),
        )
        .await
        .context(|| format!("failed to update tags of VM {}", self.machine.name))?;
        Ok(desired)
    }

    pub fn public_ip_specs(&self) -> Vec<PublicIpSpec> {
        if !self.machine.spec.allocate_public_ip {
            return Vec::new();
        }
        let name = names::node_public_ip_name(&self.machine.name);
        vec![PublicIpSpec {
            dns_name: names::public_ip_dns_name(&name, self.cluster.location()),
            name,
        }]
    }

    /// SSH NAT rule; only control-plane machines behind a public API server
    /// load balancer get one
    pub fn nat_rule_spec(&self) -> Option<InboundNatRuleSpec> {
        if !self.machine.is_control_plane() {
            return None;
        }
        self.cluster
            .api_server_lb()
            .map(|load_balancer| InboundNatRuleSpec {
                name: self.machine.name.clone(),
                load_balancer,
            })
    }

    pub fn nic_specs(&self) -> Vec<NetworkInterfaceSpec> {
        let spec = &self.machine.spec;
        let role = self.machine.role;
        let mut primary = NetworkInterfaceSpec {
            name: names::nic_name(&self.machine.name),
            subnet_id: Some(self.cluster.subnet_id(role)),
            vm_size: spec.vm_size.clone(),
            accelerated_networking: spec.accelerated_networking,
            ..Default::default()
        };

        match role {
            MachineRole::ControlPlane => {
                if let Some(lb) = self.cluster.api_server_lb() {
                    let lb_id = self.lb_id(&lb);
                    primary.backend_pools.push(
                        lb_id.child("backendAddressPools", &names::backend_pool_name(&lb)),
                    );
                    if let Some(rule) = self.nat_rule_spec() {
                        primary.nat_rules.push(self.inbound_nat_rules.id(&rule));
                    }
                }
            }
            MachineRole::Node => {
                if let Some(lb) = self.cluster.node_outbound_lb() {
                    primary.backend_pools.push(self.lb_id(&lb).child(
                        "backendAddressPools",
                        &names::outbound_backend_pool_name(&lb),
                    ));
                }
            }
        }

        let mut specs = vec![primary];
        if let Some(pip) = self.public_ip_specs().into_iter().next() {
            specs.push(NetworkInterfaceSpec {
                name: names::public_nic_name(&self.machine.name),
                subnet_id: Some(self.cluster.subnet_id(role)),
                public_ip_name: Some(pip.name),
                vm_size: spec.vm_size.clone(),
                accelerated_networking: spec.accelerated_networking,
                ..Default::default()
            });
        }
        specs
    }

    pub fn os_disk_spec(&self) -> DiskSpec {
        DiskSpec {
            name: names::os_disk_name(&self.machine.name),
        }
    }

    /// Zone for a new VM, if the location offers zones and the machine has
    /// not opted out
    pub async fn vm_zone(&self) -> Result<Option<String>> {
        let spec = &self.machine.spec;
        if !self.cluster.zonal || spec.availability_zone.enabled == Some(false) {
            return Ok(None);
        }

        let supported = self
            .capabilities
            .zones_for_size(&spec.vm_size, self.cluster.location())
            .await
            .context(|| format!("failed to get zones for VM size {}", spec.vm_size))?;
        let requested = requested_zone(
            spec.failure_domain.as_deref(),
            spec.availability_zone.id.as_deref(),
        );
        Ok(select_zone(requested.as_deref(), &supported))
    }

    pub async fn vm_spec(&self) -> Result<VmSpec> {
        let spec = &self.machine.spec;
        let decoded = STANDARD.decode(spec.ssh_public_key.trim()).map_err(|e| {
            CloudError::InvalidSpec(format!("failed to decode ssh public key: {}", e))
        })?;
        let ssh_key_data = String::from_utf8(decoded).map_err(|e| {
            CloudError::InvalidSpec(format!("ssh public key is not valid UTF-8: {}", e))
        })?;
        let image = match &spec.image {
            Some(image) => image.clone(),
            None => default_ubuntu_image(self.machine.version.as_deref())?,
        };
        Ok(VmSpec {
            name: self.machine.name.clone(),
            role: self.machine.role,
            nic_names: self.nic_specs().into_iter().map(|nic| nic.name).collect(),
            ssh_key_data,
            size: spec.vm_size.clone(),
            os_disk: spec.os_disk.clone(),
            data_disks: spec.data_disks.clone(),
            image,
            custom_data: self.machine.bootstrap_data.clone(),
            zone: self.vm_zone().await?,
            identity: spec.identity,
            user_assigned_identities: spec.user_assigned_identities.clone(),
            spot_vm_options: spec.spot_vm_options.clone(),
            additional_tags: self.additional_tags(),
        })
    }

    fn lb_id(&self, name: &str) -> ResourceId {
        self.cluster
            .resource_id(NETWORK_NAMESPACE, "loadBalancers", name)
    }

    async fn reconcile_public_ips(&self) -> Result<()> {
        for spec in self.public_ip_specs() {
            self.public_ips.reconcile(&spec).await?;
        }
        Ok(())
    }

    async fn reconcile_nat_rule(&self) -> Result<()> {
        match self.nat_rule_spec() {
            Some(spec) => self.inbound_nat_rules.reconcile(&spec).await,
            None => Ok(()),
        }
    }

    async fn reconcile_network_interfaces(&self) -> Result<()> {
        for spec in self.nic_specs() {
            self.network_interfaces.reconcile(&spec).await?;
        }
        Ok(())
    }

    async fn reconcile_virtual_machine(&self) -> Result<ObservedVm> {
        let spec = self.vm_spec().await?;
        self.virtual_machines.reconcile(&spec).await?;

        let vm = self.virtual_machines.get(&spec.name).await.context(|| {
            format!(
                "failed to get VM {} in resource group {}",
                spec.name,
                self.cluster.resource_group()
            )
        })?;

        if vm.transition() != VmTransition::Recreate {
            return Ok(vm);
        }

        warn!(vm = %spec.name, "VM provisioning failed, deleting it so it can be recreated");
        self.virtual_machines
            .delete(&spec)
            .await
            .context(|| format!("failed to delete failed VM {}", spec.name))?;
        // The OS disk stays attached until the VM is gone
        let gone = self
            .virtual_machines
            .wait_deleted(&spec.name)
            .await
            .context(|| format!("failed to wait for deletion of failed VM {}", spec.name))?;
        if !gone {
            return Err(CloudError::ProvisioningFailed(format!(
                "VM {} failed provisioning and is still present, it could not be deleted",
                spec.name
            )));
        }
        self.disks
            .delete(&self.os_disk_spec())
            .await
            .context(|| format!("failed to delete OS disk of failed VM {}", spec.name))?;

        Err(CloudError::ProvisioningFailed(format!(
            "VM {} failed provisioning and was deleted, it will be recreated on the next reconcile",
            spec.name
        )))
    }

    async fn reconcile_role_assignment(&self, vm: Option<&ObservedVm>) -> Result<()> {
        let spec = &self.machine.spec;
        if spec.identity != VmIdentity::SystemAssigned {
            return Ok(());
        }
        let Some(principal_id) = vm.and_then(|vm| vm.principal_id.clone()) else {
            debug!(machine = %self.machine.name, "system assigned identity has no principal yet");
            return Ok(());
        };

        self.role_assignments
            .reconcile(&RoleAssignmentSpec {
                name: self.role_assignment_name(),
                principal_id,
            })
            .await
    }

    fn role_assignment_name(&self) -> String {
        self.machine
            .spec
            .role_assignment_name
            .clone()
            .unwrap_or_else(|| {
                names::role_assignment_name(
                    &self.cluster.subscription_id,
                    self.cluster.resource_group(),
                    &self.machine.name,
                )
            })
    }

    async fn delete_virtual_machine(&self) -> Result<()> {
        let spec = VmSpec {
            name: self.machine.name.clone(),
            ..Default::default()
        };
        self.virtual_machines.delete(&spec).await?;
        // An unowned VM is left in place
        self.virtual_machines
            .wait_deleted(&spec.name)
            .await
            .context(|| format!("failed to wait for deletion of VM {}", spec.name))?;
        Ok(())
    }

    async fn delete_role_assignment(&self) -> Result<()> {
        if self.machine.spec.identity != VmIdentity::SystemAssigned {
            return Ok(());
        }
        let spec = RoleAssignmentSpec {
            name: self.role_assignment_name(),
            principal_id: String::new(),
        };
        self.role_assignments.delete(&spec).await
    }

    async fn delete_network_interfaces(&self) -> Result<()> {
        // Both names are tried so a flipped public-IP flag cannot leak a NIC
        for name in [
            names::nic_name(&self.machine.name),
            names::public_nic_name(&self.machine.name),
        ] {
            let spec = NetworkInterfaceSpec {
                name,
                ..Default::default()
            };
            self.network_interfaces.delete(&spec).await?;
        }
        Ok(())
    }

    async fn delete_nat_rule(&self) -> Result<()> {
        match self.nat_rule_spec() {
            Some(spec) => self.inbound_nat_rules.delete(&spec).await,
            None => Ok(()),
        }
    }

    async fn delete_public_ips(&self) -> Result<()> {
        let name = names::node_public_ip_name(&self.machine.name);
        let spec = PublicIpSpec {
            dns_name: names::public_ip_dns_name(&name, self.cluster.location()),
            name,
        };
        self.public_ips.delete(&spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::resourceskus::SkuCatalogClient;
    use crate::testing::{
        FakeArm, Method, TEST_SUBSCRIPTION, cluster_context, machine_spec, nic_id, sku,
    };
    use machineflow_cloud::{AddressKind, ProvisioningState, Tags};
    use serde_json::json;

    struct Fixture {
        arm: Arc<FakeArm>,
        cluster: Arc<ClusterContext>,
        capabilities: Arc<CapabilityCache>,
    }

    impl Fixture {
        async fn new() -> Self {
            let cluster = Arc::new(cluster_context());
            let arm = FakeArm::with_cluster(&cluster).await.unwrap();
            let catalog = Arc::new(SkuCatalogClient::new(arm.clone(), TEST_SUBSCRIPTION));
            Self {
                arm,
                cluster,
                capabilities: Arc::new(CapabilityCache::new(catalog)),
            }
        }

        fn service(&self, machine: MachineSpec) -> MachineService {
            MachineService::new(
                self.arm.clone(),
                self.cluster.clone(),
                machine,
                self.capabilities.clone(),
            )
        }

        fn vm_id(&self, name: &str) -> ResourceId {
            self.cluster
                .resource_id("Microsoft.Compute", "virtualMachines", name)
        }

        fn disk_id(&self, name: &str) -> ResourceId {
            self.cluster.resource_id("Microsoft.Compute", "disks", name)
        }

        fn vm_body(&self, name: &str) -> serde_json::Value {
            self.arm.resource(&self.vm_id(name)).unwrap()
        }
    }

    fn public_node(name: &str) -> MachineSpec {
        let mut machine = machine_spec(name, MachineRole::Node);
        machine.spec.allocate_public_ip = true;
        machine
    }

    #[tokio::test]
    async fn test_create_order() {
        let fx = Fixture::new().await;
        let service = fx.service(public_node("m1"));

        service.reconcile(&CancellationToken::new()).await.unwrap();

        let pip = fx.arm.position(Method::Put, "/publicIPAddresses/pip-m1").unwrap();
        let nic = fx.arm.position(Method::Put, "/networkInterfaces/m1-nic").unwrap();
        let public_nic = fx
            .arm
            .position(Method::Put, "/networkInterfaces/m1-public-nic")
            .unwrap();
        let vm = fx.arm.position(Method::Put, "/virtualMachines/m1").unwrap();
        assert!(pip < nic);
        assert!(nic < vm);
        assert!(public_nic < vm);
    }

    #[tokio::test]
    async fn test_control_plane_nat_rule_precedes_nic() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("cp0", MachineRole::ControlPlane));

        service.reconcile(&CancellationToken::new()).await.unwrap();

        let rule = fx.arm.position(Method::Put, "/inboundNatRules/cp0").unwrap();
        let nic = fx.arm.position(Method::Put, "/networkInterfaces/cp0-nic").unwrap();
        assert!(rule < nic);

        let nic_body = fx.arm.resource(&nic_id(&fx.cluster, "cp0")).unwrap();
        let config = &nic_body["properties"]["ipConfigurations"][0]["properties"];
        assert!(
            config["loadBalancerBackendAddressPools"][0]["id"]
                .as_str()
                .unwrap()
                .ends_with("/backendAddressPools/demo-public-lb-backendPool")
        );
        assert!(
            config["loadBalancerInboundNatRules"][0]["id"]
                .as_str()
                .unwrap()
                .ends_with("/inboundNatRules/cp0")
        );
    }

    #[tokio::test]
    async fn test_nat_rule_ports_are_allocated_in_order() {
        let fx = Fixture::new().await;
        let cancel = CancellationToken::new();
        for name in ["cp0", "cp1"] {
            fx.service(machine_spec(name, MachineRole::ControlPlane))
                .reconcile(&cancel)
                .await
                .unwrap();
        }

        let lb = fx
            .cluster
            .resource_id(NETWORK_NAMESPACE, "loadBalancers", "demo-public-lb");
        let port = |name: &str| {
            fx.arm.resource(&lb.child("inboundNatRules", name)).unwrap()["properties"]
                ["frontendPort"]
                .as_i64()
        };
        assert_eq!(port("cp0"), Some(22));
        assert_eq!(port("cp1"), Some(2201));
    }

    #[tokio::test]
    async fn test_reconcile_reports_observed_vm() {
        let fx = Fixture::new().await;
        let vm = fx
            .service(public_node("m1"))
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(vm.name, "m1");
        assert_eq!(vm.state, ProvisioningState::Succeeded);
        assert!(vm.transition().is_ready());
        assert!(vm.id.ends_with("/virtualMachines/m1"));

        let kinds: Vec<AddressKind> = vm.addresses.iter().map(|a| a.kind).collect();
        assert_eq!(kinds[0], AddressKind::InternalDNS);
        assert_eq!(vm.addresses[0].address, "m1");
        assert!(kinds.contains(&AddressKind::InternalIP));
        assert!(kinds.contains(&AddressKind::ExternalIP));
    }

    #[tokio::test]
    async fn test_second_reconcile_issues_no_mutation() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("cp0", MachineRole::ControlPlane));
        let cancel = CancellationToken::new();

        service.reconcile(&cancel).await.unwrap();
        fx.arm.clear_calls();
        service.reconcile(&cancel).await.unwrap();

        assert!(fx.arm.mutations().is_empty(), "{:?}", fx.arm.mutations());
    }

    #[tokio::test]
    async fn test_zone_picked_from_catalog() {
        let fx = Fixture::new().await;
        fx.service(machine_spec("m1", MachineRole::Node))
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fx.vm_body("m1")["zones"], json!(["1"]));
    }

    #[tokio::test]
    async fn test_unsupported_zone_falls_back_to_first() {
        let fx = Fixture::new().await;
        fx.arm.add_sku(sku("Standard_B2s", "eastus", &["1", "2"], false));
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.vm_size = "Standard_B2s".into();
        machine.spec.failure_domain = Some("3".into());

        fx.service(machine)
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fx.vm_body("m1")["zones"], json!(["1"]));
    }

    #[tokio::test]
    async fn test_deprecated_zone_fills_in() {
        let fx = Fixture::new().await;
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.availability_zone.id = Some("2".into());

        fx.service(machine)
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fx.vm_body("m1")["zones"], json!(["2"]));
    }

    #[tokio::test]
    async fn test_no_zone_when_disabled_or_not_zonal() {
        let fx = Fixture::new().await;
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.availability_zone.enabled = Some(false);
        let service = fx.service(machine);
        assert_eq!(service.vm_zone().await.unwrap(), None);

        let mut cluster = cluster_context();
        cluster.zonal = false;
        let service = MachineService::new(
            fx.arm.clone(),
            Arc::new(cluster),
            machine_spec("m2", MachineRole::Node),
            fx.capabilities.clone(),
        );
        assert_eq!(service.vm_zone().await.unwrap(), None);
        assert_eq!(fx.arm.count(Method::List, "/skus"), 0);
    }

    #[tokio::test]
    async fn test_unknown_size_gets_no_zone() {
        let fx = Fixture::new().await;
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.vm_size = "Standard_Unknown".into();

        assert_eq!(fx.service(machine).vm_zone().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_catalog_listed_once_across_machines() {
        let fx = Fixture::new().await;
        let cancel = CancellationToken::new();
        for name in ["m1", "m2", "m3"] {
            fx.service(machine_spec(name, MachineRole::Node))
                .reconcile(&cancel)
                .await
                .unwrap();
        }
        assert_eq!(fx.arm.count(Method::List, "/skus"), 1);
    }

    #[tokio::test]
    async fn test_accelerated_networking_from_catalog() {
        let fx = Fixture::new().await;
        fx.service(machine_spec("m1", MachineRole::Node))
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        let nic = fx.arm.resource(&nic_id(&fx.cluster, "m1")).unwrap();
        assert_eq!(nic["properties"]["enableAcceleratedNetworking"], true);
    }

    #[tokio::test]
    async fn test_failed_vm_is_recreated() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("m1", MachineRole::Node));
        let cancel = CancellationToken::new();
        fx.arm.set_vm_state("Failed");

        let err = service.reconcile(&cancel).await.unwrap_err();
        assert!(matches!(err.root(), CloudError::ProvisioningFailed(_)));
        assert!(err.is_retryable());
        assert!(!fx.arm.contains(&fx.vm_id("m1")));
        assert_eq!(fx.arm.count(Method::Delete, "/virtualMachines/m1"), 1);
        assert_eq!(fx.arm.count(Method::Delete, "/disks/m1_OSDisk"), 1);

        fx.arm.set_vm_state("Succeeded");
        fx.arm.clear_calls();
        let vm = service.reconcile(&cancel).await.unwrap();
        assert!(vm.transition().is_ready());
        assert_eq!(fx.arm.count(Method::Put, "/virtualMachines/m1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_vm_recovery_waits_for_slow_delete() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("m1", MachineRole::Node));
        let cancel = CancellationToken::new();
        fx.arm.set_vm_state("Failed");
        fx.arm.set_async_deletes(2);

        let err = service.reconcile(&cancel).await.unwrap_err();

        // Deleting the disk while the VM still held it would be rejected
        assert!(matches!(err.root(), CloudError::ProvisioningFailed(_)), "{}", err);
        assert!(!fx.arm.contains(&fx.vm_id("m1")));
        assert_eq!(fx.arm.count(Method::Delete, "/disks/m1_OSDisk"), 1);
        let disk = fx.arm.resource(&fx.disk_id("m1_OSDisk")).unwrap();
        assert_eq!(disk["properties"]["provisioningState"], "Deleting");

        fx.arm.set_vm_state("Succeeded");
        let vm = service.reconcile(&cancel).await.unwrap();
        assert!(vm.transition().is_ready());
    }

    #[tokio::test]
    async fn test_failed_unowned_vm_is_not_waited_on() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("m1", MachineRole::Node));
        fx.arm.insert(
            &fx.vm_id("m1"),
            json!({ "properties": { "provisioningState": "Failed" } }),
        );

        let err = service
            .reconcile(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), CloudError::ProvisioningFailed(_)));
        assert!(fx.arm.contains(&fx.vm_id("m1")));
        assert_eq!(fx.arm.count(Method::Delete, "/virtualMachines/m1"), 0);
        assert_eq!(fx.arm.count(Method::Delete, "/disks/"), 0);
    }

    #[tokio::test]
    async fn test_creating_vm_is_returned_for_waiting() {
        let fx = Fixture::new().await;
        fx.arm.set_vm_state("Creating");

        let vm = fx
            .service(machine_spec("m1", MachineRole::Node))
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(vm.transition(), VmTransition::Wait);
        assert!(fx.arm.contains(&fx.vm_id("m1")));
    }

    #[tokio::test]
    async fn test_role_assignment_after_vm() {
        let fx = Fixture::new().await;
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.identity = VmIdentity::SystemAssigned;

        fx.service(machine)
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        let vm = fx.arm.position(Method::Put, "/virtualMachines/m1").unwrap();
        let assignment = fx.arm.position(Method::Put, "/roleAssignments/").unwrap();
        assert!(vm < assignment);

        let calls = fx.arm.calls();
        let id = ResourceId::parse(&calls[assignment].path);
        let body = fx.arm.resource(&id).unwrap();
        assert_eq!(body["properties"]["principalId"], "principal-m1");
    }

    #[tokio::test]
    async fn test_no_role_assignment_without_system_identity() {
        let fx = Fixture::new().await;
        fx.service(machine_spec("m1", MachineRole::Node))
            .reconcile(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fx.arm.count(Method::Put, "/roleAssignments/"), 0);
    }

    #[tokio::test]
    async fn test_step_failure_aborts_with_context() {
        let fx = Fixture::new().await;
        fx.arm.fail(Method::Put, "/networkInterfaces/", || {
            CloudError::Transient("throttled".into())
        });

        let err = fx
            .service(machine_spec("m1", MachineRole::Node))
            .reconcile(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            err.to_string()
                .starts_with("unable to create VM network interface")
        );
        assert!(err.is_retryable());
        assert_eq!(fx.arm.count(Method::Put, "/virtualMachines/"), 0);
    }

    #[tokio::test]
    async fn test_invalid_ssh_key_is_terminal() {
        let fx = Fixture::new().await;
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.ssh_public_key = "not base64!".into();

        let err = fx
            .service(machine)
            .reconcile(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(fx.arm.count(Method::Put, "/virtualMachines/"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = Fixture::new().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .service(public_node("m1"))
            .reconcile(&cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(fx.arm.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_delete_order() {
        let fx = Fixture::new().await;
        let service = fx.service({
            let mut m = machine_spec("cp0", MachineRole::ControlPlane);
            m.spec.allocate_public_ip = true;
            m
        });
        let cancel = CancellationToken::new();
        service.reconcile(&cancel).await.unwrap();
        fx.arm.clear_calls();

        service.delete(&cancel).await.unwrap();

        let vm = fx.arm.position(Method::Delete, "/virtualMachines/cp0").unwrap();
        let nic = fx.arm.position(Method::Delete, "/networkInterfaces/cp0-nic").unwrap();
        let rule = fx.arm.position(Method::Delete, "/inboundNatRules/cp0").unwrap();
        let pip = fx.arm.position(Method::Delete, "/publicIPAddresses/pip-cp0").unwrap();
        let disk = fx.arm.position(Method::Delete, "/disks/cp0_OSDisk").unwrap();
        assert!(vm < nic);
        assert!(nic < rule);
        assert!(rule < pip);
        assert!(pip < disk);
        assert!(!fx.arm.contains(&fx.vm_id("cp0")));
        assert!(!fx.arm.contains(&fx.disk_id("cp0_OSDisk")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_for_slow_vm_delete() {
        let fx = Fixture::new().await;
        let service = fx.service({
            let mut m = machine_spec("cp0", MachineRole::ControlPlane);
            m.spec.allocate_public_ip = true;
            m
        });
        let cancel = CancellationToken::new();
        service.reconcile(&cancel).await.unwrap();
        fx.arm.set_async_deletes(2);
        fx.arm.clear_calls();

        service.delete(&cancel).await.unwrap();

        // NICs and the OS disk are only released once the VM is gone
        let vm_gone = fx
            .arm
            .calls()
            .iter()
            .rposition(|c| c.method == Method::Get && c.path.contains("/virtualMachines/cp0"))
            .unwrap();
        let nic = fx.arm.position(Method::Delete, "/networkInterfaces/cp0-nic").unwrap();
        let rule = fx.arm.position(Method::Delete, "/inboundNatRules/cp0").unwrap();
        let pip = fx.arm.position(Method::Delete, "/publicIPAddresses/pip-cp0").unwrap();
        let disk = fx.arm.position(Method::Delete, "/disks/cp0_OSDisk").unwrap();
        assert!(vm_gone < nic);
        assert!(nic < rule && rule < pip && pip < disk);
        assert!(!fx.arm.contains(&fx.vm_id("cp0")));
        assert_eq!(fx.arm.count(Method::Delete, "/virtualMachines/cp0"), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_role_assignment() {
        let fx = Fixture::new().await;
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.identity = VmIdentity::SystemAssigned;
        let service = fx.service(machine);
        let cancel = CancellationToken::new();
        service.reconcile(&cancel).await.unwrap();
        fx.arm.clear_calls();

        service.delete(&cancel).await.unwrap();

        let vm = fx.arm.position(Method::Delete, "/virtualMachines/m1").unwrap();
        let assignment = fx.arm.position(Method::Delete, "/roleAssignments/").unwrap();
        let nic = fx.arm.position(Method::Delete, "/networkInterfaces/m1-nic").unwrap();
        assert!(vm < assignment && assignment < nic);
        assert_eq!(fx.arm.count(Method::Put, "/roleAssignments/"), 0);
    }

    #[tokio::test]
    async fn test_reconcile_tags_updates_user_tags_only() {
        let fx = Fixture::new().await;
        let cancel = CancellationToken::new();
        let mut machine = machine_spec("m1", MachineRole::Node);
        machine.spec.additional_tags.insert("team", "a");
        machine.spec.additional_tags.insert("old", "x");
        fx.service(machine.clone()).reconcile(&cancel).await.unwrap();
        let last_applied = machine.spec.additional_tags.clone();

        machine.spec.additional_tags = Tags::new();
        machine.spec.additional_tags.insert("team", "b");
        let service = fx.service(machine);
        fx.arm.clear_calls();
        let applied = service.reconcile_tags(&last_applied, &cancel).await.unwrap();

        assert_eq!(applied.get("team"), Some("b"));
        let tags = Tags::from_json(fx.vm_body("m1").get("tags"));
        assert_eq!(tags.get("team"), Some("b"));
        assert_eq!(tags.get("old"), None);
        assert!(tags.has_owned("demo"));
        assert_eq!(tags.get("Name"), Some("m1"));
        assert_eq!(fx.arm.count(Method::Patch, "/virtualMachines/m1"), 1);

        fx.arm.clear_calls();
        service.reconcile_tags(&applied, &cancel).await.unwrap();
        assert!(fx.arm.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fx = Fixture::new().await;
        let service = fx.service(public_node("m1"));
        let cancel = CancellationToken::new();
        service.reconcile(&cancel).await.unwrap();

        service.delete(&cancel).await.unwrap();
        service.delete(&cancel).await.unwrap();

        assert!(!fx.arm.contains(&fx.vm_id("m1")));
        assert!(!fx.arm.contains(&nic_id(&fx.cluster, "m1")));
    }

    #[tokio::test]
    async fn test_delete_skips_unowned_resources() {
        let fx = Fixture::new().await;
        let nic = nic_id(&fx.cluster, "m1");
        let mut foreign = Tags::new();
        foreign.insert("owner", "someone-else");
        fx.arm.insert(&nic, json!({ "tags": foreign.to_json() }));

        fx.service(machine_spec("m1", MachineRole::Node))
            .delete(&CancellationToken::new())
            .await
            .unwrap();

        assert!(fx.arm.contains(&nic));
        assert_eq!(fx.arm.count(Method::Delete, "/networkInterfaces/m1-nic"), 0);
    }

    #[tokio::test]
    async fn test_delete_failure_is_wrapped() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("m1", MachineRole::Node));
        let cancel = CancellationToken::new();
        service.reconcile(&cancel).await.unwrap();
        fx.arm.fail(Method::Delete, "/virtualMachines/", || {
            CloudError::Api("conflict".into())
        });

        let err = service.delete(&cancel).await.unwrap_err();

        assert!(err.to_string().starts_with("failed to delete virtual machine"));
        // Nothing after the VM is touched
        assert_eq!(fx.arm.count(Method::Delete, "/networkInterfaces/"), 0);
    }

    #[tokio::test]
    async fn test_vm_if_exists() {
        let fx = Fixture::new().await;
        let service = fx.service(machine_spec("m1", MachineRole::Node));

        assert!(service.vm_if_exists(None).await.unwrap().is_none());
        let id = fx.vm_id("m1");
        assert!(service.vm_if_exists(Some(id.as_str())).await.unwrap().is_none());

        service.reconcile(&CancellationToken::new()).await.unwrap();
        let vm = service.vm_if_exists(Some(id.as_str())).await.unwrap().unwrap();
        assert_eq!(vm.name, "m1");
    }
}
