use super::Runtime;
use crate::ClusterCommand;
use colored::Colorize;
use machineflow_config::Settings;
use machineflow_controller::{ClusterReconciler, ObjectKey, ObjectStore, TracingRecorder};
use std::sync::Arc;

pub async fn handle(settings: &Settings, command: ClusterCommand) -> anyhow::Result<()> {
    let runtime = Runtime::new(settings)?;
    let reconciler = ClusterReconciler::new(
        runtime.arm.clone(),
        runtime.store.clone(),
        Arc::new(TracingRecorder),
        runtime.options.clone(),
    );

    match command {
        ClusterCommand::Reconcile { namespace, name } => {
            let key = ObjectKey::new(namespace, name);
            println!("{}", format!("Reconciling cluster {}...", key).yellow());
            reconciler.reconcile(&key, &runtime.cancel).await?;

            match runtime.store.get_cluster(&key).await? {
                Some(cluster) if cluster.status.ready => {
                    println!("  {} infrastructure ready", "✓".green())
                }
                Some(_) => println!("  {} infrastructure not ready", "!".yellow()),
                None => anyhow::bail!("cluster {} not found", key),
            }
        }
        ClusterCommand::Delete { namespace, name } => {
            let key = ObjectKey::new(namespace, name);
            if !runtime.store.mark_cluster_deleted(&key)? {
                anyhow::bail!("cluster {} not found", key);
            }
            println!("{}", format!("Deleting cluster {}...", key).yellow());
            reconciler.reconcile(&key, &runtime.cancel).await?;

            if runtime.store.get_cluster(&key).await?.is_none() {
                println!("  {} deleted", "✓".green());
            } else {
                println!("  {} infrastructure remains, run delete again", "!".yellow());
            }
        }
    }
    Ok(())
}
