//! Operator-visible events

use crate::object::ObjectKey;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

pub const REASON_DEPRECATED_FIELD: &str = "DeprecatedField";
pub const REASON_UNEXPECTED_VM_DELETION: &str = "UnexpectedVMDeletion";
pub const REASON_UNHANDLED_VM_STATE: &str = "UnhandledVMState";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_PROVISIONING_FAILED: &str = "ProvisioningFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub object: ObjectKey,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn warning(object: &ObjectKey, reason: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: reason.to_string(),
            message: message.into(),
            object: object.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink for events; the reconcilers never read them back
#[cfg_attr(test, automock)]
pub trait Recorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Emits events as log records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl Recorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                object = %event.object,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => warn!(
                object = %event.object,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}
