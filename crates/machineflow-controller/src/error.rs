//! Controller error types

use machineflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Bootstrap data secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("Cluster {namespace}/{name} not found")]
    ClusterNotFound { namespace: String, name: String },
}

impl ControllerError {
    /// Whether a later re-invocation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Cloud(e) => e.is_retryable(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
