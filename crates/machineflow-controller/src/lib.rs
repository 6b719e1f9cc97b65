//! MachineFlow controller
//!
//! Reconciles machine and cluster objects against the Azure provider. The
//! object store, secret store and event sink are traits so the same
//! reconcilers run against the CLI's file store or an in-memory store in
//! tests.

pub mod controller;
pub mod error;
pub mod events;
pub mod object;
pub mod scope;
pub mod store;
pub mod validation;

pub use controller::{
    ClusterReconciler, MachineReconciler, Outcome, ReconcilerOptions, retry_after,
};
pub use error::{ControllerError, Result};
pub use events::{Event, EventType, Recorder, TracingRecorder};
pub use object::{
    ClusterObject, ClusterPatch, FailureReason, LAST_APPLIED_TAGS_ANNOTATION, MachineObject,
    MachinePatch, ObjectKey, PROVIDER_ANNOTATION,
};
pub use scope::ClusterDefaults;
pub use store::{MemoryStore, ObjectStore, SecretStore};
