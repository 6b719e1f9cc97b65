pub mod cluster;
pub mod machine;

use crate::file_store::FileStore;
use machineflow_cloud_azure::{ArmApi, ArmClient};
use machineflow_config::Settings;
use machineflow_controller::{ClusterDefaults, ReconcilerOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything a command needs to talk to the provider and the store
pub struct Runtime {
    pub arm: Arc<dyn ArmApi>,
    pub store: Arc<FileStore>,
    pub options: ReconcilerOptions,
    pub cancel: CancellationToken,
}

impl Runtime {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let token = settings.arm_token()?;
        let arm = ArmClient::new(&settings.arm_endpoint, token)?;
        Ok(Self {
            arm: Arc::new(arm),
            store: Arc::new(FileStore::new(&settings.store_dir)),
            options: options(settings),
            cancel: cancel_on_ctrl_c(),
        })
    }
}

pub fn options(settings: &Settings) -> ReconcilerOptions {
    ReconcilerOptions {
        defaults: ClusterDefaults {
            subscription_id: settings.subscription_id.clone(),
            zonal_locations: settings.zonal_locations.clone(),
        },
        reconcile_timeout: Duration::from_secs(settings.reconcile_timeout_secs),
        max_provisioning_recoveries: settings.max_provisioning_recoveries,
        ..Default::default()
    }
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}
