//! Azure provider error types

use machineflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AzureError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ARM returned {status} ({code}): {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Operation on {id} ended {status}: {message}")]
    OperationFailed {
        id: String,
        status: String,
        message: String,
    },

    #[error("Invalid ARM response: {0}")]
    InvalidResponse(String),

    #[error("Missing ARM access token. Set MACHINEFLOW_ARM_TOKEN or AZURE_ACCESS_TOKEN")]
    MissingToken,
}

/// ARM error codes that mean the addressed resource does not exist
const NOT_FOUND_CODES: &[&str] = &["ResourceNotFound", "NotFound", "ResourceGroupNotFound"];

impl AzureError {
    pub fn is_not_found(&self) -> bool {
        match self {
            AzureError::Status { status, code, .. } => {
                *status == 404 || NOT_FOUND_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Throttling, timeouts, server-side errors and transport failures
    pub fn is_transient(&self) -> bool {
        match self {
            AzureError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..=599).contains(status)
            }
            AzureError::Http(_) => true,
            _ => false,
        }
    }
}

impl From<AzureError> for CloudError {
    fn from(err: AzureError) -> Self {
        if err.is_not_found() {
            CloudError::NotFound(err.to_string())
        } else if err.is_transient() {
            CloudError::Transient(err.to_string())
        } else {
            CloudError::Api(err.to_string())
        }
    }
}
