//! Cloud convergence error types
//!
//! Every adapter error is classified into one of these variants before it
//! crosses a component boundary, and wrapped with the resource it concerns so
//! the top-level caller can log an attributable message.

use thiserror::Error;

/// Cloud convergence errors
#[derive(Error, Debug)]
pub enum CloudError {
    /// The provider reports the resource as absent
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Malformed or incomplete desired spec; never retried
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// 5xx, throttling, timeouts and transport failures
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Any other provider-side rejection
    #[error("API error: {0}")]
    Api(String),

    /// The VM failed provisioning and was torn down for re-creation
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CloudError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Wrap this error with a description of where it happened
    pub fn wrap(self, context: impl Into<String>) -> Self {
        CloudError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost, unwrapped error
    pub fn root(&self) -> &CloudError {
        match self {
            CloudError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), CloudError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), CloudError::Cancelled)
    }

    /// Whether re-invoking reconciliation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            CloudError::Transient(_)
                | CloudError::ProvisioningFailed(_)
                | CloudError::Timeout(_)
                | CloudError::Cancelled
                | CloudError::Api(_)
                | CloudError::Io(_)
        )
    }

    /// Whether the error must stop automatic retries
    pub fn is_terminal(&self) -> bool {
        matches!(self.root(), CloudError::InvalidSpec(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Attach context to the error side of a [`Result`]
pub trait ResultExt<T> {
    fn context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.wrap(f()))
    }
}
