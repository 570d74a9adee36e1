//! Error types for the Stash operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// A data-transfer (restic) operation failed
    #[error("Data transfer error: {0}")]
    DataTransfer(String),

    /// Provisioning of RBAC objects for a job failed
    #[error("RBAC error: {0}")]
    Rbac(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a data-transfer error
    pub fn data_transfer(msg: impl Into<String>) -> Self {
        Error::DataTransfer(msg.into())
    }

    /// Create an RBAC provisioning error
    pub fn rbac(msg: impl Into<String>) -> Self {
        Error::Rbac(msg.into())
    }

    /// Whether the work queue should retry the key that produced this error.
    ///
    /// Retrying an invalid spec cannot succeed, so validation errors are
    /// terminal; everything else may be transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Validation(_))
    }

    /// Whether this is an API `AlreadyExists` response
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(e) if is_already_exists(e))
    }
}

/// Whether a kube error is the API server's `AlreadyExists` response
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Whether a kube error is the API server's `NotFound` response
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
