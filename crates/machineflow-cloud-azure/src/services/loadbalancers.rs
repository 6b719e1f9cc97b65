//! Public load balancers: the API server front door and node egress
//!
//! A load balancer is created once and then left alone, since a PUT would
//! replace the inbound NAT rules machines add to it.

use super::{delete_if_owned, get_optional};
use crate::arm::{ArmApi, NETWORK_API_VERSION, NETWORK_NAMESPACE, ResourceId};
use crate::names;
use crate::spec::ClusterContext;
use async_trait::async_trait;
use machineflow_cloud::tags::{API_SERVER_ROLE, NODE_ROLE};
use machineflow_cloud::{
    BuildParams, CloudError, ResourceKind, ResourceLifecycle, ResourceReconciler, Result,
    ResultExt, Tags,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

pub const API_SERVER_PORT: i64 = 6443;
pub const OUTBOUND_RULE_NAME: &str = "OutboundNATAllProtocols";
pub const API_SERVER_PROBE_NAME: &str = "tcpHTTPSProbe";
pub const API_SERVER_RULE_NAME: &str = "LBRuleHTTPS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerRole {
    ApiServer,
    NodeOutbound,
}

impl LoadBalancerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerRole::ApiServer => API_SERVER_ROLE,
            LoadBalancerRole::NodeOutbound => NODE_ROLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub public_ip_name: String,
    pub role: LoadBalancerRole,
}

impl LoadBalancerSpec {
    pub fn backend_pool_name(&self) -> String {
        match self.role {
            LoadBalancerRole::ApiServer => names::backend_pool_name(&self.name),
            LoadBalancerRole::NodeOutbound => names::outbound_backend_pool_name(&self.name),
        }
    }
}

pub struct LoadBalancerService {
    arm: Arc<dyn ArmApi>,
    cluster: Arc<ClusterContext>,
}

impl LoadBalancerService {
    pub fn new(arm: Arc<dyn ArmApi>, cluster: Arc<ClusterContext>) -> Self {
        Self { arm, cluster }
    }

    pub fn id(&self, name: &str) -> ResourceId {
        self.cluster
            .resource_id(NETWORK_NAMESPACE, "loadBalancers", name)
    }

    fn body(&self, spec: &LoadBalancerSpec, public_ip: &ResourceId) -> Value {
        let id = self.id(&spec.name);
        let frontend_name = names::frontend_ip_config_name(&spec.name);
        let pool_name = spec.backend_pool_name();
        let frontend = id.child("frontendIPConfigurations", &frontend_name);
        let pool = id.child("backendAddressPools", &pool_name);

        let tags = Tags::build(BuildParams {
            cluster_name: &self.cluster.name,
            lifecycle: ResourceLifecycle::Owned,
            name: Some(&spec.name),
            role: Some(spec.role.as_str()),
            additional: self.cluster.additional_tags(),
        });
        let mut body = json!({
            "location": self.cluster.location(),
            "tags": tags.to_json(),
            "sku": { "name": "Standard" },
            "properties": {
                "frontendIPConfigurations": [{
                    "name": frontend_name,
                    "properties": { "publicIPAddress": { "id": public_ip.as_str() } },
                }],
                "backendAddressPools": [{ "name": pool_name }],
                "outboundRules": [{
                    "name": OUTBOUND_RULE_NAME,
                    "properties": {
                        "protocol": "All",
                        "frontendIPConfigurations": [{ "id": frontend.as_str() }],
                        "backendAddressPool": { "id": pool.as_str() },
                    },
                }],
            },
        });

        if spec.role == LoadBalancerRole::ApiServer {
            let probe = id.child("probes", API_SERVER_PROBE_NAME);
            body["properties"]["probes"] = json!([{
                "name": API_SERVER_PROBE_NAME,
                "properties": {
                    "protocol": "Tcp",
                    "port": API_SERVER_PORT,
                    "intervalInSeconds": 15,
                    "numberOfProbes": 4,
                },
            }]);
            // Egress goes through the outbound rule
            body["properties"]["loadBalancingRules"] = json!([{
                "name": API_SERVER_RULE_NAME,
                "properties": {
                    "disableOutboundSnat": true,
                    "protocol": "Tcp",
                    "frontendPort": API_SERVER_PORT,
                    "backendPort": API_SERVER_PORT,
                    "idleTimeoutInMinutes": 4,
                    "enableFloatingIP": false,
                    "loadDistribution": "Default",
                    "frontendIPConfiguration": { "id": frontend.as_str() },
                    "backendAddressPool": { "id": pool.as_str() },
                    "probe": { "id": probe.as_str() },
                },
            }]);
        }
        body
    }
}

#[async_trait]
impl ResourceReconciler for LoadBalancerService {
    type Spec = LoadBalancerSpec;

    fn kind(&self) -> ResourceKind {
        ResourceKind::LoadBalancer
    }

    async fn reconcile(&self, spec: &LoadBalancerSpec) -> Result<()> {
        let id = self.id(&spec.name);
        let rg = self.cluster.resource_group();
        if get_optional(self.arm.as_ref(), &id, NETWORK_API_VERSION)
            .await
            .context(|| {
                format!(
                    "failed to get load balancer {} in resource group {}",
                    spec.name, rg
                )
            })?
            .is_some()
        {
            debug!(load_balancer = %spec.name, "load balancer already exists");
            return Ok(());
        }

        let public_ip = self
            .cluster
            .resource_id(NETWORK_NAMESPACE, "publicIPAddresses", &spec.public_ip_name);
        let found = get_optional(self.arm.as_ref(), &public_ip, NETWORK_API_VERSION)
            .await
            .context(|| format!("failed to look for public IP {}", spec.public_ip_name))?;
        if found.is_none() {
            return Err(CloudError::NotFound(format!(
                "public IP {} not found in resource group {}",
                spec.public_ip_name, rg
            )));
        }

        info!(load_balancer = %spec.name, role = spec.role.as_str(), "creating load balancer");
        self.arm
            .put(&id, NETWORK_API_VERSION, &self.body(spec, &public_ip))
            .await
            .context(|| {
                format!(
                    "cannot create load balancer {} in resource group {}",
                    spec.name, rg
                )
            })?;
        Ok(())
    }

    async fn delete(&self, spec: &LoadBalancerSpec) -> Result<()> {
        delete_if_owned(
            self.arm.as_ref(),
            self.kind(),
            &self.id(&spec.name),
            NETWORK_API_VERSION,
            self.cluster.resource_group(),
            &self.cluster.name,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeArm, Method, TEST_API_SERVER_LB, cluster_context};
    use machineflow_cloud::tags::ROLE_TAG_KEY;

    fn setup() -> (Arc<FakeArm>, LoadBalancerService) {
        let arm = Arc::new(FakeArm::new());
        (arm.clone(), LoadBalancerService::new(arm, Arc::new(cluster_context())))
    }

    fn api_server_spec() -> LoadBalancerSpec {
        LoadBalancerSpec {
            name: TEST_API_SERVER_LB.to_string(),
            public_ip_name: names::api_server_public_ip_name("demo"),
            role: LoadBalancerRole::ApiServer,
        }
    }

    fn seed_public_ip(arm: &FakeArm, service: &LoadBalancerService, name: &str) {
        let id = service
            .cluster
            .resource_id(NETWORK_NAMESPACE, "publicIPAddresses", name);
        arm.insert(&id, json!({ "properties": {} }));
    }

    #[tokio::test]
    async fn test_api_server_lb_balances_https() {
        let (arm, service) = setup();
        let spec = api_server_spec();
        seed_public_ip(&arm, &service, &spec.public_ip_name);

        service.reconcile(&spec).await.unwrap();

        let lb = arm.resource(&service.id(&spec.name)).unwrap();
        let tags = Tags::from_json(lb.get("tags"));
        assert!(tags.has_owned("demo"));
        assert_eq!(tags.get(ROLE_TAG_KEY), Some("apiserver"));
        let props = &lb["properties"];
        assert_eq!(props["backendAddressPools"][0]["name"], "demo-public-lb-backendPool");
        assert_eq!(props["probes"][0]["properties"]["port"], 6443);
        let rule = &props["loadBalancingRules"][0]["properties"];
        assert_eq!(rule["disableOutboundSnat"], true);
        assert!(
            rule["probe"]["id"]
                .as_str()
                .unwrap()
                .ends_with("/probes/tcpHTTPSProbe")
        );
        assert_eq!(props["outboundRules"][0]["name"], OUTBOUND_RULE_NAME);
    }

    #[tokio::test]
    async fn test_outbound_lb_has_no_inbound_rules() {
        let (arm, service) = setup();
        let spec = LoadBalancerSpec {
            name: "demo".to_string(),
            public_ip_name: names::node_outbound_public_ip_name("demo"),
            role: LoadBalancerRole::NodeOutbound,
        };
        seed_public_ip(&arm, &service, &spec.public_ip_name);

        service.reconcile(&spec).await.unwrap();

        let lb = arm.resource(&service.id("demo")).unwrap();
        let props = &lb["properties"];
        assert_eq!(props["backendAddressPools"][0]["name"], "demo-outboundBackendPool");
        assert!(props.get("loadBalancingRules").is_none());
        assert!(props.get("probes").is_none());
    }

    #[tokio::test]
    async fn test_existing_lb_is_left_alone() {
        let (arm, service) = setup();
        let spec = api_server_spec();
        seed_public_ip(&arm, &service, &spec.public_ip_name);
        service.reconcile(&spec).await.unwrap();

        arm.clear_calls();
        service.reconcile(&spec).await.unwrap();
        assert!(arm.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_missing_public_ip_is_not_found() {
        let (arm, service) = setup();
        let err = service.reconcile(&api_server_spec()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("pip-demo-apiserver"));
        assert_eq!(arm.count(Method::Put, "/loadBalancers/"), 0);
    }
}
