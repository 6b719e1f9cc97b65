//! Observed virtual-machine state and the provisioning state machine
//!
//! Nothing here is persisted between reconciliations: every call re-observes
//! the provider and re-evaluates the full transition table.

use serde::{Deserialize, Serialize};

/// Provider-reported provisioning state of a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Succeeded,
    Failed,
    Deleting,
    /// Any value the provider reports that is not recognized
    Undefined,
}

impl ProvisioningState {
    /// Parse a provider value; unknown values map to [`ProvisioningState::Undefined`]
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "creating" => ProvisioningState::Creating,
            "updating" => ProvisioningState::Updating,
            "succeeded" => ProvisioningState::Succeeded,
            "failed" => ProvisioningState::Failed,
            "deleting" => ProvisioningState::Deleting,
            _ => ProvisioningState::Undefined,
        }
    }

    pub fn transition(&self) -> VmTransition {
        VmTransition::for_state(*self)
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Creating => write!(f, "Creating"),
            ProvisioningState::Updating => write!(f, "Updating"),
            ProvisioningState::Succeeded => write!(f, "Succeeded"),
            ProvisioningState::Failed => write!(f, "Failed"),
            ProvisioningState::Deleting => write!(f, "Deleting"),
            ProvisioningState::Undefined => write!(f, "Undefined"),
        }
    }
}

/// What the orchestrator and its caller do after observing a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmTransition {
    /// Terminal success: mark ready and propagate id and addresses
    Ready,
    /// Still converging: mark not ready and wait for re-invocation
    Wait,
    /// Failed provisioning: delete the VM and its OS disk, then retry
    Recreate,
    /// Deleting without a delete request: warn, no recovery
    UnexpectedDeletion,
    /// Unrecognized state: surface an error, no destructive action
    Unhandled,
}

impl VmTransition {
    pub fn for_state(state: ProvisioningState) -> Self {
        match state {
            ProvisioningState::Succeeded => VmTransition::Ready,
            ProvisioningState::Creating | ProvisioningState::Updating => VmTransition::Wait,
            ProvisioningState::Failed => VmTransition::Recreate,
            ProvisioningState::Deleting => VmTransition::UnexpectedDeletion,
            ProvisioningState::Undefined => VmTransition::Unhandled,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, VmTransition::Ready)
    }
}

/// Kind of a machine network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressKind {
    InternalDNS,
    InternalIP,
    ExternalIP,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmAddress {
    #[serde(rename = "type")]
    pub kind: AddressKind,
    pub address: String,
}

impl VmAddress {
    pub fn new(kind: AddressKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

/// A virtual machine as currently reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedVm {
    /// Provider resource id
    pub id: String,
    pub name: String,
    pub state: ProvisioningState,
    pub addresses: Vec<VmAddress>,
    /// Principal of the system-assigned identity, once the provider created it
    pub principal_id: Option<String>,
    pub zone: Option<String>,
}

impl ObservedVm {
    pub fn transition(&self) -> VmTransition {
        self.state.transition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(ProvisioningState::parse("Succeeded"), ProvisioningState::Succeeded);
        assert_eq!(ProvisioningState::parse("creating"), ProvisioningState::Creating);
        assert_eq!(ProvisioningState::parse("UPDATING"), ProvisioningState::Updating);
        assert_eq!(ProvisioningState::parse("Failed"), ProvisioningState::Failed);
        assert_eq!(ProvisioningState::parse("Deleting"), ProvisioningState::Deleting);
    }

    #[test]
    fn test_unknown_values_are_undefined() {
        assert_eq!(ProvisioningState::parse("Migrating"), ProvisioningState::Undefined);
        assert_eq!(ProvisioningState::parse(""), ProvisioningState::Undefined);
    }

    #[test]
    fn test_transition_table_is_complete() {
        let cases = [
            (ProvisioningState::Succeeded, VmTransition::Ready),
            (ProvisioningState::Creating, VmTransition::Wait),
            (ProvisioningState::Updating, VmTransition::Wait),
            (ProvisioningState::Failed, VmTransition::Recreate),
            (ProvisioningState::Deleting, VmTransition::UnexpectedDeletion),
            (ProvisioningState::Undefined, VmTransition::Unhandled),
        ];
        for (state, expected) in cases {
            assert_eq!(state.transition(), expected, "state {}", state);
        }
        assert!(VmTransition::Ready.is_ready());
        assert!(!VmTransition::Wait.is_ready());
    }
}
