#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn machineflow() -> Command {
    let mut cmd = Command::cargo_bin("machineflow").unwrap();
    cmd.env_remove("MACHINEFLOW_CONFIG")
        .env_remove("MACHINEFLOW_ARM_TOKEN")
        .env_remove("AZURE_ACCESS_TOKEN");
    cmd
}

#[test]
fn test_cli_help() {
    machineflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("machine"))
        .stdout(predicate::str::contains("cluster"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn test_cli_version() {
    machineflow()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("machineflow"));
}

#[test]
fn test_machine_reconcile_help() {
    machineflow()
        .args(["machine", "reconcile", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<NAMESPACE>"))
        .stdout(predicate::str::contains("--wait"));
}

#[test]
fn test_invalid_command() {
    machineflow().arg("invalid-command").assert().failure();
}

#[test]
fn test_reconcile_without_token_fails() {
    let dir = tempfile::tempdir().unwrap();
    machineflow()
        .current_dir(dir.path())
        .args(["machine", "reconcile", "default", "m1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MACHINEFLOW_ARM_TOKEN"));
}

#[test]
fn test_machine_status_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let machines = dir.path().join("store").join("default").join("machines");
    fs::create_dir_all(&machines).unwrap();
    fs::write(
        machines.join("m1.yaml"),
        r#"
metadata:
  name: m1
spec:
  clusterName: demo
  providerID: azure:///subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/m1
  vmSize: Standard_D2s_v3
  osDisk:
    osType: Linux
    diskSizeGB: 30
    managedDisk:
      storageAccountType: Premium_LRS
  sshPublicKey: c3NoLXJzYQ==
status:
  ready: true
  vmState: Succeeded
"#,
    )
    .unwrap();
    let config = dir.path().join("machineflow.yaml");
    fs::write(&config, "storeDir: store\n").unwrap();

    machineflow()
        .current_dir(dir.path())
        .args(["--config", "machineflow.yaml", "machine", "status", "default", "m1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Succeeded"))
        .stdout(predicate::str::contains("azure:///subscriptions/s"));
}

#[test]
fn test_missing_machine_status_fails() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("machineflow.yaml"), "storeDir: store\n").unwrap();

    machineflow()
        .current_dir(dir.path())
        .args(["machine", "status", "default", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
