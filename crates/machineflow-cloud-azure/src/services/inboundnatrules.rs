//! Inbound NAT rules giving SSH access to control-plane machines
//!
//! NAT rules are sub-resources of the API server load balancer and carry no
//! tags; they are identified by the machine name.

use super::delete_ignoring_not_found;
use crate::arm::{ArmApi, NETWORK_API_VERSION, NETWORK_NAMESPACE, ResourceId};
use crate::names;
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::{CloudError, ResourceKind, ResourceReconciler, Result, ResultExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

/// SSH port on the machine side of every rule
pub const SSH_BACKEND_PORT: i64 = 22;

/// Frontend ports tried in order: 22 first, then 2201 through 2220
pub fn ssh_frontend_ports() -> impl Iterator<Item = i64> {
    std::iter::once(22).chain(2201..=2220)
}

/// First SSH frontend port not used by any existing rule
pub fn allocate_ssh_port(used: &[i64]) -> Option<i64> {
    ssh_frontend_ports().find(|port| !used.contains(port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNatRuleSpec {
    /// Rule name, equal to the machine name
    pub name: String,
    pub load_balancer: String,
}

pub struct InboundNatRuleService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl InboundNatRuleService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    pub fn lb_id(&self, load_balancer: &str) -> ResourceId {
        self.cluster
            .resource_id(NETWORK_NAMESPACE, "loadBalancers", load_balancer)
    }

    pub fn id(&self, spec: &InboundNatRuleSpec) -> ResourceId {
        self.lb_id(&spec.load_balancer)
            .child("inboundNatRules", &spec.name)
    }
}

fn rule_name(rule: &Value) -> Option<&str> {
    rule.get("name").and_then(Value::as_str)
}

fn frontend_port(rule: &Value) -> Option<i64> {
    rule.pointer("/properties/frontendPort")
        .and_then(Value::as_i64)
}

#[async_trait]
impl ResourceReconciler for InboundNatRuleService {
    type Spec = InboundNatRuleSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::InboundNatRule
    }

    async fn reconcile(&self, spec: &InboundNatRuleSpec) -> Result<()> {
        let lb_id = self.lb_id(&spec.load_balancer);
        let rules = self
            .arm
            .list(
                &lb_id.collection("inboundNatRules"),
                NETWORK_API_VERSION,
                None,
            )
            .await
            .context(|| format!("failed to get load balancer {}", spec.load_balancer))?;

        if rules
            .iter()
            .any(|rule| rule_name(rule) == Some(spec.name.as_str()))
        {
            debug!(rule = %spec.name, "NAT rule already exists");
            return Ok(());
        }

        let used: Vec<i64> = rules.iter().filter_map(frontend_port).collect();
        let port = allocate_ssh_port(&used).ok_or_else(|| {
            CloudError::Api(format!(
                "no available SSH frontend ports on load balancer {}",
                spec.load_balancer
            ))
        })?;

        info!(
            rule = %spec.name,
            port,
            load_balancer = %spec.load_balancer,
            "creating inbound NAT rule"
        );
        let frontend = lb_id.child(
            "frontendIPConfigurations",
            &names::frontend_ip_config_name(&spec.load_balancer),
        );
        let body = json!({
            "name": spec.name,
            "properties": {
                "frontendIPConfiguration": { "id": frontend.as_str() },
                "protocol": "Tcp",
                "frontendPort": port,
                "backendPort": SSH_BACKEND_PORT,
                "enableFloatingIP": false,
                "idleTimeoutInMinutes": 4,
            },
        });
        self.arm
            .put(&self.id(spec), NETWORK_API_VERSION, &body)
            .await
            .context(|| {
                format!(
                    "failed to create inbound NAT rule {} on load balancer {}",
                    spec.name, spec.load_balancer
                )
            })?;
        Ok(())
    }

    async fn delete(&self, spec: &InboundNatRuleSpec) -> Result<()> {
        delete_ignoring_not_found(
            self.arm.as_ref(),
            self.kind(),
            &self.id(spec),
            NETWORK_API_VERSION,
            self.cluster.resource_group(),
        )
        .await
    }
}
