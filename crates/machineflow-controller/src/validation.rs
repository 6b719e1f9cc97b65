//! Static checks on a machine definition
//!
//! A definition that fails here can never converge, so the machine is marked
//! with a terminal failure instead of being retried.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use machineflow_cloud_azure::{AzureMachineSpec, VmIdentity};
use std::collections::HashSet;
use std::fmt;

pub const MIN_DISK_SIZE_GB: i32 = 1;
pub const MAX_DISK_SIZE_GB: i32 = 2048;

pub const STORAGE_ACCOUNT_TYPES: [&str; 4] =
    ["Premium_LRS", "Standard_LRS", "StandardSSD_LRS", "UltraSSD_LRS"];

const SSH_KEY_TYPES: [&str; 6] = [
    "ssh-rsa",
    "ssh-ed25519",
    "ssh-dss",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Joined messages for status reporting
pub fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn validate_machine(spec: &AzureMachineSpec) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if spec.vm_size.trim().is_empty() {
        errors.push(FieldError::new("spec.vmSize", "must not be empty"));
    }
    if let Err(message) = validate_ssh_key(&spec.ssh_public_key) {
        errors.push(FieldError::new("spec.sshPublicKey", message));
    }

    let os_disk = &spec.os_disk;
    if os_disk.os_type.trim().is_empty() {
        errors.push(FieldError::new("spec.osDisk.osType", "must not be empty"));
    }
    if let Err(message) = validate_disk_size(os_disk.disk_size_gb) {
        errors.push(FieldError::new("spec.osDisk.diskSizeGB", message));
    }
    let storage = &os_disk.managed_disk.storage_account_type;
    if !STORAGE_ACCOUNT_TYPES.contains(&storage.as_str()) {
        errors.push(FieldError::new(
            "spec.osDisk.managedDisk.storageAccountType",
            format!(
                "unsupported value {:?}, expected one of {}",
                storage,
                STORAGE_ACCOUNT_TYPES.join(", ")
            ),
        ));
    }

    let mut suffixes = HashSet::new();
    let mut luns = HashSet::new();
    for (i, disk) in spec.data_disks.iter().enumerate() {
        let field = format!("spec.dataDisks[{}]", i);
        if let Err(message) = validate_disk_size(disk.disk_size_gb) {
            errors.push(FieldError::new(format!("{}.diskSizeGB", field), message));
        }
        if disk.name_suffix.is_empty() {
            errors.push(FieldError::new(
                format!("{}.nameSuffix", field),
                "must not be empty",
            ));
        } else if !suffixes.insert(disk.name_suffix.as_str()) {
            errors.push(FieldError::new(
                format!("{}.nameSuffix", field),
                format!("duplicate name suffix {}", disk.name_suffix),
            ));
        }
        if let Some(lun) = disk.lun {
            if !luns.insert(lun) {
                errors.push(FieldError::new(
                    format!("{}.lun", field),
                    format!("duplicate lun {}", lun),
                ));
            }
        }
    }

    if spec.identity == VmIdentity::UserAssigned && spec.user_assigned_identities.is_empty() {
        errors.push(FieldError::new(
            "spec.userAssignedIdentities",
            "must be set when identity is UserAssigned",
        ));
    }

    errors
}

fn validate_disk_size(size: i32) -> Result<(), String> {
    if (MIN_DISK_SIZE_GB..=MAX_DISK_SIZE_GB).contains(&size) {
        Ok(())
    } else {
        Err(format!(
            "must be between {} and {}, got {}",
            MIN_DISK_SIZE_GB, MAX_DISK_SIZE_GB, size
        ))
    }
}

/// The key must be base64 of an authorized-keys line
fn validate_ssh_key(encoded: &str) -> Result<(), String> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("not valid base64: {}", e))?;
    let line = String::from_utf8(decoded).map_err(|_| "not valid UTF-8".to_string())?;

    let mut fields = line.split_whitespace();
    let (Some(key_type), Some(blob)) = (fields.next(), fields.next()) else {
        return Err("not an authorized key line".into());
    };
    if !SSH_KEY_TYPES.contains(&key_type) {
        return Err(format!("unsupported key type {}", key_type));
    }
    STANDARD
        .decode(blob)
        .map_err(|_| "key material is not valid base64".to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use machineflow_cloud_azure::spec::DataDisk;
    use machineflow_cloud_azure::testing::azure_machine_spec;

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_machine(&azure_machine_spec()).is_empty());
    }

    #[test]
    fn test_ssh_key_checks() {
        let mut spec = azure_machine_spec();
        spec.ssh_public_key = "not base64!".into();
        assert_eq!(fields(&validate_machine(&spec)), ["spec.sshPublicKey"]);

        spec.ssh_public_key = STANDARD.encode("hello");
        assert_eq!(fields(&validate_machine(&spec)), ["spec.sshPublicKey"]);

        spec.ssh_public_key = STANDARD.encode("ssh-foo AAAA");
        assert_eq!(fields(&validate_machine(&spec)), ["spec.sshPublicKey"]);
    }

    #[test]
    fn test_disk_size_bounds() {
        let mut spec = azure_machine_spec();
        spec.os_disk.disk_size_gb = 0;
        assert_eq!(fields(&validate_machine(&spec)), ["spec.osDisk.diskSizeGB"]);

        spec.os_disk.disk_size_gb = 2048;
        assert!(validate_machine(&spec).is_empty());

        spec.os_disk.disk_size_gb = 2049;
        assert_eq!(fields(&validate_machine(&spec)), ["spec.osDisk.diskSizeGB"]);
    }

    #[test]
    fn test_os_disk_type_and_storage() {
        let mut spec = azure_machine_spec();
        spec.os_disk.os_type = String::new();
        spec.os_disk.managed_disk.storage_account_type = "Fast_LRS".into();

        assert_eq!(
            fields(&validate_machine(&spec)),
            [
                "spec.osDisk.osType",
                "spec.osDisk.managedDisk.storageAccountType"
            ]
        );
    }

    #[test]
    fn test_duplicate_data_disks() {
        let mut spec = azure_machine_spec();
        let disk = DataDisk {
            name_suffix: "etcd".into(),
            disk_size_gb: 256,
            lun: Some(0),
        };
        spec.data_disks = vec![disk.clone(), disk];

        let errors = validate_machine(&spec);
        assert_eq!(
            fields(&errors),
            ["spec.dataDisks[1].nameSuffix", "spec.dataDisks[1].lun"]
        );
        assert!(summarize(&errors).contains("duplicate name suffix etcd"));
    }

    #[test]
    fn test_user_assigned_identity_requires_ids() {
        let mut spec = azure_machine_spec();
        spec.identity = VmIdentity::UserAssigned;
        assert_eq!(
            fields(&validate_machine(&spec)),
            ["spec.userAssignedIdentities"]
        );

        spec.user_assigned_identities = vec!["/subscriptions/x/identity".into()];
        assert!(validate_machine(&spec).is_empty());
    }
}
