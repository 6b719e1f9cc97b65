use super::Runtime;
use crate::MachineCommand;
use crate::file_store::FileStore;
use colored::Colorize;
use machineflow_config::Settings;
use machineflow_controller::{
    MachineObject, MachineReconciler, ObjectKey, ObjectStore, Outcome, TracingRecorder,
};
use std::sync::Arc;

pub async fn handle(settings: &Settings, command: MachineCommand) -> anyhow::Result<()> {
    match command {
        MachineCommand::Reconcile {
            namespace,
            name,
            wait,
        } => reconcile(settings, ObjectKey::new(namespace, name), wait).await,
        MachineCommand::Delete { namespace, name } => {
            delete(settings, ObjectKey::new(namespace, name)).await
        }
        MachineCommand::Status { namespace, name } => {
            let store = FileStore::new(&settings.store_dir);
            let key = ObjectKey::new(namespace, name);
            let machine = store
                .get_machine(&key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("machine {} not found", key))?;
            print_status(&machine);
            Ok(())
        }
    }
}

fn reconciler(runtime: &Runtime) -> MachineReconciler {
    MachineReconciler::new(
        runtime.arm.clone(),
        runtime.store.clone(),
        runtime.store.clone(),
        Arc::new(TracingRecorder),
        runtime.options.clone(),
    )
}

async fn reconcile(settings: &Settings, key: ObjectKey, wait: bool) -> anyhow::Result<()> {
    let runtime = Runtime::new(settings)?;
    let reconciler = reconciler(&runtime);
    println!("{}", format!("Reconciling machine {}...", key).yellow());

    loop {
        match reconciler.reconcile(&key, &runtime.cancel).await? {
            Outcome::Requeue(after) if wait => {
                println!(
                    "  {} still provisioning, checking again in {}s",
                    "…".blue(),
                    after.as_secs()
                );
                tokio::select! {
                    _ = runtime.cancel.cancelled() => anyhow::bail!("interrupted"),
                    _ = tokio::time::sleep(after) => {}
                }
            }
            Outcome::Requeue(after) => {
                println!(
                    "  {} not ready yet, run again in {}s",
                    "…".blue(),
                    after.as_secs()
                );
                break;
            }
            Outcome::Done => break,
        }
    }

    match runtime.store.get_machine(&key).await? {
        Some(machine) => print_status(&machine),
        None => println!("{}", format!("machine {} not found", key).red()),
    }
    Ok(())
}

async fn delete(settings: &Settings, key: ObjectKey) -> anyhow::Result<()> {
    let runtime = Runtime::new(settings)?;
    if !runtime.store.mark_machine_deleted(&key)? {
        anyhow::bail!("machine {} not found", key);
    }
    println!("{}", format!("Deleting machine {}...", key).yellow());

    reconciler(&runtime).reconcile(&key, &runtime.cancel).await?;

    if runtime.store.get_machine(&key).await?.is_none() {
        println!("  {} deleted", "✓".green());
    } else {
        println!("  {} cloud resources remain, run delete again", "!".yellow());
    }
    Ok(())
}

fn print_status(machine: &MachineObject) {
    let status = &machine.status;
    println!();
    println!("{}", machine.metadata.name.bold());
    let ready = if status.ready {
        "yes".green()
    } else {
        "no".yellow()
    };
    println!("  ready:       {}", ready);
    if let Some(state) = &status.vm_state {
        println!("  vm state:    {}", state.cyan());
    }
    if let Some(provider_id) = &machine.spec.provider_id {
        println!("  provider id: {}", provider_id);
    }
    for address in &status.addresses {
        println!("  {:<12} {}", format!("{:?}:", address.kind), address.address);
    }
    if let Some(reason) = status.failure_reason {
        println!("  failure:     {}", reason.to_string().red());
    }
    if let Some(message) = &status.failure_message {
        println!("  message:     {}", message.red());
    }
}
