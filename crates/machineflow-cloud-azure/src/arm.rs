//! Azure Resource Manager client
//!
//! Every resource this provider touches is addressed by its ARM resource id
//! and manipulated with plain GET / PUT / PATCH / DELETE calls. A DELETE the
//! provider accepts asynchronously is followed until the operation finishes,
//! so a successful return means the resource is gone. PUT is not followed;
//! the next reconciliation observes the provisioning state instead.

use crate::error::AzureError;
use async_trait::async_trait;
use machineflow_cloud::Result;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const NETWORK_API_VERSION: &str = "2021-08-01";
pub const COMPUTE_API_VERSION: &str = "2021-11-01";
pub const DISK_API_VERSION: &str = "2021-08-01";
pub const RESOURCES_API_VERSION: &str = "2021-04-01";
pub const AUTHORIZATION_API_VERSION: &str = "2022-04-01";
pub const SKUS_API_VERSION: &str = "2021-07-01";

pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// Delay between operation polls when the provider suggests none
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";

pub const NETWORK_NAMESPACE: &str = "Microsoft.Network";
pub const COMPUTE_NAMESPACE: &str = "Microsoft.Compute";
pub const AUTHORIZATION_NAMESPACE: &str = "Microsoft.Authorization";

/// Fully qualified ARM resource id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn subscription(subscription_id: &str) -> Self {
        Self(format!("/subscriptions/{}", subscription_id))
    }

    pub fn resource_group(subscription_id: &str, resource_group: &str) -> Self {
        Self(format!(
            "/subscriptions/{}/resourceGroups/{}",
            subscription_id, resource_group
        ))
    }

    /// Wrap an id reported by the provider
    pub fn parse(id: &str) -> Self {
        Self(id.trim_end_matches('/').to_string())
    }

    /// Resource of a provider namespace below this scope
    pub fn provider(&self, namespace: &str, resource_type: &str, name: &str) -> Self {
        Self(format!(
            "{}/providers/{}/{}/{}",
            self.0, namespace, resource_type, name
        ))
    }

    /// Child resource of this resource
    pub fn child(&self, resource_type: &str, name: &str) -> Self {
        Self(format!("{}/{}/{}", self.0, resource_type, name))
    }

    /// Collection path of a child resource type
    pub fn collection(&self, resource_type: &str) -> String {
        format!("{}/{}", self.0, resource_type)
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generic ARM operations
///
/// Implementations classify failures into [`machineflow_cloud::CloudError`];
/// a missing resource must surface as `NotFound`.
#[async_trait]
pub trait ArmApi: Send + Sync {
    async fn get(&self, id: &ResourceId, api_version: &str) -> Result<Value>;

    /// Create or replace a resource and return the provider's view of it
    async fn put(&self, id: &ResourceId, api_version: &str, body: &Value) -> Result<Value>;

    /// Update the given top-level fields of an existing resource
    async fn patch(&self, id: &ResourceId, api_version: &str, body: &Value) -> Result<Value>;

    /// Delete a resource; returns once the provider no longer has it
    async fn delete(&self, id: &ResourceId, api_version: &str) -> Result<()>;

    /// List a collection, following `nextLink` pages
    async fn list(&self, path: &str, api_version: &str, filter: Option<&str>)
    -> Result<Vec<Value>>;
}

#[derive(Debug, Deserialize)]
struct ArmErrorResponse {
    error: ArmErrorBody,
}

#[derive(Debug, Deserialize)]
struct ArmErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Status document behind an `Azure-AsyncOperation` header
#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    status: String,
    error: Option<ArmErrorBody>,
}

/// Where an accepted long-running operation is followed
#[derive(Debug, Clone, PartialEq, Eq)]
enum PollTarget {
    /// Status document with a terminal `status` field
    AsyncOperation(String),
    /// 202 while running, anything else once done
    Location(String),
}

#[derive(Debug, PartialEq, Eq)]
enum OperationState {
    Running,
    Succeeded,
    Failed { status: String, message: String },
}

fn poll_target(headers: &HeaderMap) -> Option<PollTarget> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header(ASYNC_OPERATION_HEADER)
        .map(PollTarget::AsyncOperation)
        .or_else(|| header(LOCATION.as_str()).map(PollTarget::Location))
}

/// `Retry-After` in seconds, clamped to a sane range
fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).clamp(Duration::from_secs(1), MAX_POLL_INTERVAL))
        .unwrap_or(DEFAULT_POLL_INTERVAL)
}

fn operation_state(body: Value) -> std::result::Result<OperationState, AzureError> {
    let operation: OperationStatus =
        serde_json::from_value(body).map_err(|e| AzureError::InvalidResponse(e.to_string()))?;
    let state = match operation.status.to_ascii_lowercase().as_str() {
        "succeeded" => OperationState::Succeeded,
        "failed" | "canceled" | "cancelled" => {
            let message = operation
                .error
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_default();
            OperationState::Failed {
                status: operation.status,
                message,
            }
        }
        _ => OperationState::Running,
    };
    Ok(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmPage {
    #[serde(default)]
    value: Vec<Value>,
    next_link: Option<String>,
}

/// reqwest-backed [`ArmApi`] using a bearer token
pub struct ArmClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ArmClient {
    pub fn new(endpoint: &str, token: impl Into<String>) -> std::result::Result<Self, AzureError> {
        let token = token.into();
        if token.is_empty() {
            return Err(AzureError::MissingToken);
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("machineflow/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<Value, AzureError> {
        let (_, _, body) = self.execute(request).await?;
        Ok(body)
    }

    /// Send a request; success yields the status, headers and parsed body
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<(StatusCode, HeaderMap, Value), AzureError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok((status, headers, Value::Null));
            }
            let value = serde_json::from_str(&body)
                .map_err(|e| AzureError::InvalidResponse(e.to_string()))?;
            return Ok((status, headers, value));
        }

        let (code, message) = match serde_json::from_str::<ArmErrorResponse>(&body) {
            Ok(resp) => (resp.error.code, resp.error.message),
            Err(_) => (String::new(), body),
        };
        Err(AzureError::Status {
            status: status.as_u16(),
            code,
            message,
        })
    }

    /// Follow an accepted operation until the provider reports it finished
    async fn wait_for_operation(
        &self,
        id: &ResourceId,
        target: PollTarget,
        mut delay: Duration,
    ) -> std::result::Result<(), AzureError> {
        loop {
            tokio::time::sleep(delay).await;
            match &target {
                PollTarget::AsyncOperation(url) => {
                    let (_, headers, body) = self.execute(self.client.get(url)).await?;
                    match operation_state(body)? {
                        OperationState::Succeeded => return Ok(()),
                        OperationState::Failed { status, message } => {
                            return Err(AzureError::OperationFailed {
                                id: id.to_string(),
                                status,
                                message,
                            });
                        }
                        OperationState::Running => delay = retry_after(&headers),
                    }
                }
                PollTarget::Location(url) => {
                    let (status, headers, _) = match self.execute(self.client.get(url)).await {
                        Err(e) if e.is_not_found() => return Ok(()),
                        result => result?,
                    };
                    if status != StatusCode::ACCEPTED {
                        return Ok(());
                    }
                    delay = retry_after(&headers);
                }
            }
            debug!(id = %id, "operation still running");
        }
    }
}

#[async_trait]
impl ArmApi for ArmClient {
    async fn get(&self, id: &ResourceId, api_version: &str) -> Result<Value> {
        debug!(id = %id, "ARM GET");
        let request = self
            .client
            .get(self.url(id.as_str()))
            .query(&[("api-version", api_version)]);
        Ok(self.send(request).await?)
    }

    async fn put(&self, id: &ResourceId, api_version: &str, body: &Value) -> Result<Value> {
        debug!(id = %id, "ARM PUT");
        let request = self
            .client
            .put(self.url(id.as_str()))
            .query(&[("api-version", api_version)])
            .json(body);
        Ok(self.send(request).await?)
    }

    async fn patch(&self, id: &ResourceId, api_version: &str, body: &Value) -> Result<Value> {
        debug!(id = %id, "ARM PATCH");
        let request = self
            .client
            .patch(self.url(id.as_str()))
            .query(&[("api-version", api_version)])
            .json(body);
        Ok(self.send(request).await?)
    }

    async fn delete(&self, id: &ResourceId, api_version: &str) -> Result<()> {
        debug!(id = %id, "ARM DELETE");
        let request = self
            .client
            .delete(self.url(id.as_str()))
            .query(&[("api-version", api_version)]);
        // 200 and 204 mean done; 201 and 202 hand back an operation to follow
        let (status, headers, _) = self.execute(request).await?;
        if !matches!(status, StatusCode::CREATED | StatusCode::ACCEPTED) {
            return Ok(());
        }
        match poll_target(&headers) {
            Some(target) => {
                debug!(id = %id, "waiting for deletion to finish");
                Ok(self
                    .wait_for_operation(id, target, retry_after(&headers))
                    .await?)
            }
            None => Ok(()),
        }
    }

    async fn list(
        &self,
        path: &str,
        api_version: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Value>> {
        debug!(path, "ARM LIST");
        let mut query = vec![("api-version", api_version)];
        if let Some(filter) = filter {
            query.push(("$filter", filter));
        }

        let mut items = Vec::new();
        let mut request = self.client.get(self.url(path)).query(&query);
        loop {
            let page: ArmPage = serde_json::from_value(self.send(request).await?)?;
            items.extend(page.value);
            match page.next_link {
                // nextLink already carries api-version and the skip token
                Some(next) if !next.is_empty() => request = self.client.get(next),
                _ => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_builders() {
        let rg = ResourceId::resource_group("sub", "rg");
        assert_eq!(rg.as_str(), "/subscriptions/sub/resourceGroups/rg");

        let lb = rg.provider(NETWORK_NAMESPACE, "loadBalancers", "lb");
        assert_eq!(
            lb.as_str(),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/lb"
        );
        assert_eq!(lb.name(), "lb");

        let rule = lb.child("inboundNatRules", "m1");
        assert_eq!(rule.name(), "m1");
        assert!(rule.as_str().ends_with("/loadBalancers/lb/inboundNatRules/m1"));
    }

    #[test]
    fn test_parse_trims_trailing_slash() {
        let id = ResourceId::parse("/subscriptions/sub/resourceGroups/rg/");
        assert_eq!(id.name(), "rg");
    }

    fn headers(entries: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_poll_target_prefers_async_operation() {
        let both = headers(&[
            ("azure-asyncoperation", "https://arm/operations/1"),
            ("location", "https://arm/results/1"),
        ]);
        assert_eq!(
            poll_target(&both),
            Some(PollTarget::AsyncOperation("https://arm/operations/1".into()))
        );

        let location = headers(&[("location", "https://arm/results/1")]);
        assert_eq!(
            poll_target(&location),
            Some(PollTarget::Location("https://arm/results/1".into()))
        );
        assert_eq!(poll_target(&HeaderMap::new()), None);
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(retry_after(&HeaderMap::new()), DEFAULT_POLL_INTERVAL);
        assert_eq!(
            retry_after(&headers(&[("retry-after", "10")])),
            Duration::from_secs(10)
        );
        assert_eq!(
            retry_after(&headers(&[("retry-after", "0")])),
            Duration::from_secs(1)
        );
        assert_eq!(
            retry_after(&headers(&[("retry-after", "3600")])),
            MAX_POLL_INTERVAL
        );
        assert_eq!(
            retry_after(&headers(&[("retry-after", "soon")])),
            DEFAULT_POLL_INTERVAL
        );
    }

    #[test]
    fn test_operation_state() {
        let state = |body| operation_state(body).unwrap();
        assert_eq!(
            state(serde_json::json!({ "status": "InProgress" })),
            OperationState::Running
        );
        assert_eq!(
            state(serde_json::json!({ "status": "Succeeded" })),
            OperationState::Succeeded
        );
        assert_eq!(
            state(serde_json::json!({
                "status": "Failed",
                "error": { "code": "OperationNotAllowed", "message": "disk is attached" }
            })),
            OperationState::Failed {
                status: "Failed".into(),
                message: "OperationNotAllowed: disk is attached".into(),
            }
        );
        assert!(matches!(
            state(serde_json::json!({ "status": "Canceled" })),
            OperationState::Failed { .. }
        ));
    }

    #[test]
    fn test_failed_operation_is_not_retryable() {
        let err = machineflow_cloud::CloudError::from(AzureError::OperationFailed {
            id: "/subscriptions/s/resourceGroups/rg".into(),
            status: "Failed".into(),
            message: "boom".into(),
        });
        assert!(matches!(err, machineflow_cloud::CloudError::Api(_)));
    }

    #[test]
    fn test_empty_token_is_rejected() {
        assert!(matches!(
            ArmClient::new(DEFAULT_ARM_ENDPOINT, ""),
            Err(AzureError::MissingToken)
        ));
    }
}
