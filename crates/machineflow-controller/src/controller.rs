//! Machine and cluster reconcilers
//!
//! Each invocation loads the object, converges the provider resources once
//! and reports the outcome in status. Nothing is retried in-process: the
//! caller re-invokes on [`Outcome::Requeue`] or on a retryable error.

use crate::error::{ControllerError, Result};
use crate::events::{
    Event, REASON_DEPRECATED_FIELD, REASON_PROVISIONING_FAILED, REASON_RECONCILE_ERROR,
    REASON_UNEXPECTED_VM_DELETION, REASON_UNHANDLED_VM_STATE, Recorder,
};
use crate::object::{
    CLUSTER_FINALIZER, FailureReason, MACHINE_FINALIZER, ObjectKey, PROVIDER_ANNOTATION,
};
use crate::scope::{ClusterDefaults, ClusterScope, MachineScope, cluster_context};
use crate::store::{ObjectStore, SecretStore};
use crate::validation::{summarize, validate_machine};
use machineflow_cloud::{CapabilityCache, CloudError, ObservedVm, VmTransition};
use machineflow_cloud_azure::{ArmApi, ClusterService, MachineService, SkuCatalogClient};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(90 * 60);
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PROVISIONING_RECOVERIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub defaults: ClusterDefaults,
    /// Upper bound for one invocation
    pub reconcile_timeout: Duration,
    /// Delay suggested to the caller while the provider is still working
    pub requeue_after: Duration,
    /// Failed provisioning attempts tolerated before the machine is marked
    /// failed for good
    pub max_provisioning_recoveries: u32,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            defaults: ClusterDefaults::default(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            requeue_after: DEFAULT_REQUEUE_AFTER,
            max_provisioning_recoveries: DEFAULT_MAX_PROVISIONING_RECOVERIES,
        }
    }
}

/// What the caller should do after a successful invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, or nothing to do until the object changes
    Done,
    /// Invoke again after the delay
    Requeue(Duration),
}

/// Delay before retrying an invocation that failed with `err`; `None` when
/// retrying cannot help
pub fn retry_after(err: &ControllerError) -> Option<Duration> {
    err.is_retryable().then_some(DEFAULT_REQUEUE_AFTER)
}

/// Run `operation` within the timeout, aborting it when `cancel` fires
async fn bounded<T>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CloudError::Cancelled.into()),
        result = tokio::time::timeout(timeout, operation) => match result {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout(format!(
                "reconcile did not finish within {}s",
                timeout.as_secs()
            ))
            .into()),
        },
    }
}

/// Capability caches keyed by subscription
#[derive(Default)]
struct CapabilityCaches {
    caches: Mutex<HashMap<String, Arc<CapabilityCache>>>,
}

impl CapabilityCaches {
    fn get(&self, arm: &Arc<dyn ArmApi>, subscription_id: &str) -> Arc<CapabilityCache> {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        caches
            .entry(subscription_id.to_string())
            .or_insert_with(|| {
                let catalog = SkuCatalogClient::new(arm.clone(), subscription_id);
                Arc::new(CapabilityCache::new(Arc::new(catalog)))
            })
            .clone()
    }
}

pub struct MachineReconciler {
    arm: Arc<dyn ArmApi>,
    store: Arc<dyn ObjectStore>,
    secrets: Arc<dyn SecretStore>,
    recorder: Arc<dyn Recorder>,
    capabilities: CapabilityCaches,
    options: ReconcilerOptions,
}

impl MachineReconciler {
    pub fn new(
        arm: Arc<dyn ArmApi>,
        store: Arc<dyn ObjectStore>,
        secrets: Arc<dyn SecretStore>,
        recorder: Arc<dyn Recorder>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            arm,
            store,
            secrets,
            recorder,
            capabilities: CapabilityCaches::default(),
            options,
        }
    }

    #[instrument(skip(self, cancel), fields(machine = %key))]
    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome> {
        let Some(machine) = self.store.get_machine(key).await? else {
            debug!("machine not found");
            return Ok(Outcome::Done);
        };
        let cluster_key = ObjectKey::new(&machine.metadata.namespace, &machine.spec.cluster_name);
        let Some(cluster) = self.store.get_cluster(&cluster_key).await? else {
            info!(cluster = %cluster_key, "cluster not found, waiting for it");
            return Ok(Outcome::Done);
        };

        let mut scope = MachineScope::new(machine, cluster, self.store.clone());
        let result = bounded(
            cancel,
            self.options.reconcile_timeout,
            self.reconcile_scope(&mut scope, cancel),
        )
        .await;

        let closed = scope.close().await;
        let outcome = result?;
        closed?;
        Ok(outcome)
    }

    async fn reconcile_scope(
        &self,
        scope: &mut MachineScope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if scope.machine.metadata.is_deleting() {
            self.reconcile_delete(scope, cancel).await
        } else {
            self.reconcile_normal(scope, cancel).await
        }
    }

    async fn reconcile_normal(
        &self,
        scope: &mut MachineScope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if let Some(reason) = scope.failure_reason() {
            info!(%reason, "machine has a terminal failure, skipping");
            return Ok(Outcome::Done);
        }

        scope.machine.metadata.add_finalizer(MACHINE_FINALIZER);

        if !scope.cluster.status.ready {
            info!("cluster infrastructure is not ready yet");
            return Ok(Outcome::Done);
        }
        if scope.machine.spec.bootstrap_secret.is_none() {
            info!("bootstrap data secret is not available yet");
            return Ok(Outcome::Done);
        }

        if scope.machine.spec.azure.availability_zone.id.is_some() {
            self.recorder.record(Event::warning(
                scope.key(),
                REASON_DEPRECATED_FIELD,
                "availabilityZone is deprecated, use failureDomain instead",
            ));
        }

        let errors = validate_machine(&scope.machine.spec.azure);
        if !errors.is_empty() {
            let message = summarize(&errors);
            warn!(%message, "invalid machine definition");
            self.recorder.record(Event::warning(
                scope.key(),
                REASON_RECONCILE_ERROR,
                message.clone(),
            ));
            scope.set_failure(FailureReason::InvalidConfiguration, message);
            return Ok(Outcome::Done);
        }

        let Some(bootstrap_data) = scope.bootstrap_data(self.secrets.as_ref()).await? else {
            return Ok(Outcome::Done);
        };

        let cluster = Arc::new(cluster_context(&scope.cluster, &self.options.defaults));
        let capabilities = self.capabilities.get(&self.arm, &cluster.subscription_id);
        let service = MachineService::new(
            self.arm.clone(),
            cluster,
            scope.machine_spec(bootstrap_data),
            capabilities,
        );

        let vm = match self.get_or_create(&service, scope.vm_id(), cancel).await {
            Ok(vm) => vm,
            Err(err) => return self.handle_error(scope, err),
        };
        scope.set_annotation(PROVIDER_ANNOTATION, "true");
        if vm.transition().is_ready() {
            if let Err(err) = self.reconcile_tags(scope, &service, cancel).await {
                return self.handle_error(scope, err);
            }
        }
        self.apply_transition(scope, &vm)
    }

    /// Converge the user tags of a provisioned VM and record what was applied
    async fn reconcile_tags(
        &self,
        scope: &mut MachineScope,
        service: &MachineService,
        cancel: &CancellationToken,
    ) -> machineflow_cloud::Result<()> {
        let applied = service
            .reconcile_tags(&scope.last_applied_tags(), cancel)
            .await?;
        scope.set_last_applied_tags(&applied);
        Ok(())
    }

    /// The recorded VM if the provider still has it in a usable state,
    /// otherwise a full orchestrator pass
    async fn get_or_create(
        &self,
        service: &MachineService,
        vm_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> machineflow_cloud::Result<ObservedVm> {
        if let Some(vm) = service.vm_if_exists(vm_id).await? {
            if vm.transition() != VmTransition::Recreate {
                debug!(vm = %vm.name, "found existing VM");
                return Ok(vm);
            }
        }
        service.reconcile(cancel).await
    }

    fn apply_transition(&self, scope: &mut MachineScope, vm: &ObservedVm) -> Result<Outcome> {
        scope.set_vm(vm);
        match vm.transition() {
            VmTransition::Ready => {
                info!(vm = %vm.name, "VM is running");
                scope.set_ready(true);
                scope.machine.status.provisioning_recoveries = 0;
                Ok(Outcome::Done)
            }
            VmTransition::Wait => {
                info!(vm = %vm.name, state = %vm.state, "VM is still provisioning");
                scope.set_ready(false);
                Ok(Outcome::Requeue(self.options.requeue_after))
            }
            VmTransition::UnexpectedDeletion => {
                warn!(vm = %vm.name, "VM is being deleted unexpectedly");
                scope.set_ready(false);
                self.recorder.record(Event::warning(
                    scope.key(),
                    REASON_UNEXPECTED_VM_DELETION,
                    format!("VM {} is being deleted unexpectedly", vm.name),
                ));
                Ok(Outcome::Done)
            }
            VmTransition::Unhandled | VmTransition::Recreate => {
                let message = format!("VM {} is in an unhandled state {}", vm.name, vm.state);
                warn!(vm = %vm.name, state = %vm.state, "unhandled VM state");
                scope.set_ready(false);
                scope.set_failure_message(message.clone());
                self.recorder.record(Event::warning(
                    scope.key(),
                    REASON_UNHANDLED_VM_STATE,
                    message.clone(),
                ));
                Err(CloudError::Api(message).into())
            }
        }
    }

    fn handle_error(&self, scope: &mut MachineScope, err: CloudError) -> Result<Outcome> {
        scope.set_ready(false);
        if err.is_cancelled() {
            return Err(err.into());
        }

        let message = err.to_string();
        if err.is_terminal() {
            warn!(error = %message, "machine cannot be created");
            self.recorder.record(Event::warning(
                scope.key(),
                REASON_RECONCILE_ERROR,
                message.clone(),
            ));
            scope.set_failure(FailureReason::CreateMachineError, message);
            return Ok(Outcome::Done);
        }

        if matches!(err.root(), CloudError::ProvisioningFailed(_)) {
            let status = &mut scope.machine.status;
            status.provisioning_recoveries += 1;
            let attempts = status.provisioning_recoveries;
            if attempts > self.options.max_provisioning_recoveries {
                warn!(attempts, "giving up on VM provisioning");
                self.recorder.record(Event::warning(
                    scope.key(),
                    REASON_PROVISIONING_FAILED,
                    format!("{}; giving up after {} attempts", message, attempts),
                ));
                scope.set_failure(FailureReason::UpdateMachineError, message);
                return Ok(Outcome::Done);
            }
            self.recorder.record(Event::warning(
                scope.key(),
                REASON_PROVISIONING_FAILED,
                message.clone(),
            ));
            scope.set_failure_message(message);
            return Ok(Outcome::Requeue(self.options.requeue_after));
        }

        self.recorder.record(Event::warning(
            scope.key(),
            REASON_RECONCILE_ERROR,
            message.clone(),
        ));
        scope.set_failure_message(message);
        Err(err.into())
    }

    async fn reconcile_delete(
        &self,
        scope: &mut MachineScope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if !scope.machine.metadata.has_finalizer(MACHINE_FINALIZER) {
            debug!("no finalizer, nothing to clean up");
            return Ok(Outcome::Done);
        }

        let cluster = Arc::new(cluster_context(&scope.cluster, &self.options.defaults));
        let capabilities = self.capabilities.get(&self.arm, &cluster.subscription_id);
        let service = MachineService::new(
            self.arm.clone(),
            cluster,
            scope.machine_spec(String::new()),
            capabilities,
        );

        scope.set_ready(false);
        if let Err(err) = service.delete(cancel).await {
            if !err.is_cancelled() {
                let message = err.to_string();
                self.recorder.record(Event::warning(
                    scope.key(),
                    REASON_RECONCILE_ERROR,
                    message.clone(),
                ));
                scope.set_failure_message(message);
            }
            return Err(err.into());
        }

        info!("machine resources deleted, removing finalizer");
        scope.machine.metadata.remove_finalizer(MACHINE_FINALIZER);
        Ok(Outcome::Done)
    }
}

pub struct ClusterReconciler {
    arm: Arc<dyn ArmApi>,
    store: Arc<dyn ObjectStore>,
    recorder: Arc<dyn Recorder>,
    options: ReconcilerOptions,
}

impl ClusterReconciler {
    pub fn new(
        arm: Arc<dyn ArmApi>,
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn Recorder>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            arm,
            store,
            recorder,
            options,
        }
    }

    #[instrument(skip(self, cancel), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome> {
        let Some(cluster) = self.store.get_cluster(key).await? else {
            debug!("cluster not found");
            return Ok(Outcome::Done);
        };

        let mut scope = ClusterScope::new(cluster, self.store.clone());
        let result = bounded(
            cancel,
            self.options.reconcile_timeout,
            self.reconcile_scope(&mut scope, cancel),
        )
        .await;

        let closed = scope.close().await;
        let outcome = result?;
        closed?;
        Ok(outcome)
    }

    async fn reconcile_scope(
        &self,
        scope: &mut ClusterScope,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let context = Arc::new(cluster_context(&scope.cluster, &self.options.defaults));
        let service = ClusterService::new(self.arm.clone(), context);
        let metadata = &scope.cluster.metadata;

        if metadata.is_deleting() {
            if !metadata.has_finalizer(CLUSTER_FINALIZER) {
                return Ok(Outcome::Done);
            }
            scope.cluster.status.ready = false;
            self.run(scope.key(), service.delete(cancel)).await?;
            scope.cluster.metadata.remove_finalizer(CLUSTER_FINALIZER);
            return Ok(Outcome::Done);
        }

        scope.cluster.metadata.add_finalizer(CLUSTER_FINALIZER);
        self.run(scope.key(), service.reconcile(cancel)).await?;
        scope.cluster.status.ready = true;
        Ok(Outcome::Done)
    }

    async fn run(
        &self,
        key: &ObjectKey,
        operation: impl Future<Output = machineflow_cloud::Result<()>>,
    ) -> Result<()> {
        operation.await.map_err(|err| {
            if !err.is_cancelled() {
                self.recorder
                    .record(Event::warning(key, REASON_RECONCILE_ERROR, err.to_string()));
            }
            ControllerError::from(err)
        })
    }
}
