//! Cluster infrastructure: resource group, virtual network and subnets,
//! and the public load balancers with their addresses

use crate::arm::ArmApi;
use crate::machine::guarded;
use crate::names;
use crate::services::groups::{GroupService, GroupSpec};
use crate::services::loadbalancers::{LoadBalancerRole, LoadBalancerService, LoadBalancerSpec};
use crate::services::publicips::{PublicIpService, PublicIpSpec};
use crate::services::subnets::{SubnetService, SubnetSpec};
use crate::services::virtualnetworks::{VirtualNetworkService, VnetSpec};
use crate::spec::{ClusterContext, MachineRole};
use machineflow_cloud::{ResourceReconciler, Result, ResultExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ClusterService {
    cluster: Arc<ClusterContext>,
    groups: GroupService,
    virtual_networks: VirtualNetworkService,
    subnets: SubnetService,
    public_ips: PublicIpService,
    load_balancers: LoadBalancerService,
}

impl ClusterService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self {
            groups: GroupService::new(arm.clone(), cluster.clone()),
            virtual_networks: VirtualNetworkService::new(arm.clone(), cluster.clone()),
            subnets: SubnetService::new(arm.clone(), cluster.clone()),
            public_ips: PublicIpService::new(arm.clone(), cluster.clone()),
            load_balancers: LoadBalancerService::new(arm, cluster.clone()),
            cluster,
        }
    }

    pub fn group_spec(&self) -> GroupSpec {
        GroupSpec {
            name: self.cluster.resource_group().to_string(),
            location: self.cluster.location().to_string(),
        }
    }

    pub fn vnet_spec(&self) -> VnetSpec {
        VnetSpec {
            resource_group: self.cluster.vnet_resource_group().to_string(),
            name: self.cluster.vnet_name(),
            cidr: self.cluster.vnet_cidr(),
        }
    }

    /// Control plane subnet first, then the node subnet
    pub fn subnet_specs(&self) -> Vec<SubnetSpec> {
        [MachineRole::ControlPlane, MachineRole::Node]
            .into_iter()
            .map(|role| SubnetSpec {
                name: self.cluster.subnet_name(role),
                cidr: self.cluster.subnet_cidr(role),
                role,
            })
            .collect()
    }

    /// Load balancers the cluster asks for, each with the public IP it fronts
    pub fn load_balancer_specs(&self) -> Vec<LoadBalancerSpec> {
        let cluster = &self.cluster.name;
        let mut specs = Vec::new();
        if let Some(name) = self.cluster.api_server_lb() {
            specs.push(LoadBalancerSpec {
                name,
                public_ip_name: names::api_server_public_ip_name(cluster),
                role: LoadBalancerRole::ApiServer,
            });
        }
        if let Some(name) = self.cluster.node_outbound_lb() {
            specs.push(LoadBalancerSpec {
                name,
                public_ip_name: names::node_outbound_public_ip_name(cluster),
                role: LoadBalancerRole::NodeOutbound,
            });
        }
        specs
    }

    fn public_ip_spec(&self, lb: &LoadBalancerSpec) -> PublicIpSpec {
        PublicIpSpec {
            name: lb.public_ip_name.clone(),
            dns_name: names::public_ip_dns_name(&lb.public_ip_name, self.cluster.location()),
        }
    }

    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<()> {
        guarded(cancel, self.groups.reconcile(&self.group_spec()))
            .await
            .context(|| "failed to reconcile resource group")?;
        guarded(cancel, self.virtual_networks.reconcile(&self.vnet_spec()))
            .await
            .context(|| "failed to reconcile virtual network")?;
        for spec in self.subnet_specs() {
            guarded(cancel, self.subnets.reconcile(&spec))
                .await
                .context(|| format!("failed to reconcile subnet {}", spec.name))?;
        }
        for spec in self.load_balancer_specs() {
            let public_ip = self.public_ip_spec(&spec);
            guarded(cancel, self.public_ips.reconcile(&public_ip))
                .await
                .context(|| format!("failed to reconcile public IP {}", public_ip.name))?;
            guarded(cancel, self.load_balancers.reconcile(&spec))
                .await
                .context(|| format!("failed to reconcile load balancer {}", spec.name))?;
        }
        info!(cluster = %self.cluster.name, "cluster infrastructure reconciled");
        Ok(())
    }

    /// Tear down in reverse creation order. Anything not owned by this
    /// cluster is kept.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        for spec in self.load_balancer_specs() {
            guarded(cancel, self.load_balancers.delete(&spec))
                .await
                .context(|| format!("failed to delete load balancer {}", spec.name))?;
            let public_ip = self.public_ip_spec(&spec);
            guarded(cancel, self.public_ips.delete(&public_ip))
                .await
                .context(|| format!("failed to delete public IP {}", public_ip.name))?;
        }
        for spec in self.subnet_specs().iter().rev() {
            guarded(cancel, self.subnets.delete(spec))
                .await
                .context(|| format!("failed to delete subnet {}", spec.name))?;
        }
        guarded(cancel, self.virtual_networks.delete(&self.vnet_spec()))
            .await
            .context(|| "failed to delete virtual network")?;
        guarded(cancel, self.groups.delete(&self.group_spec()))
            .await
            .context(|| "failed to delete resource group")?;
        info!(cluster = %self.cluster.name, "cluster infrastructure deleted");
        Ok(())
    }
}
