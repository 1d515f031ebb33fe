//! Error types for the Slurm Kubernetes operator.

use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Slurm REST API error.
    #[error("Slurm API error: {0}")]
    SlurmError(#[from] slurm_client::ClientError),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource spec validation error.
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// Slurm auth token could not be minted or parsed.
    #[error("Slurm auth token error: {0}")]
    TokenError(#[from] jsonwebtoken::errors::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Several sub-steps of one sync pass failed.
    #[error("{} errors during sync: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<OperatorError>),
}

fn join_errors(errors: &[OperatorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl OperatorError {
    /// Whether the error means the target object no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(kube::Error::Api(err)) => err.code == 404,
            OperatorError::SlurmError(err) => err.is_not_found(),
            OperatorError::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(OperatorError::is_not_found)
            }
            _ => false,
        }
    }

    /// Build a not-found error for a namespaced object.
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is itself, more is an aggregate.
    pub fn from_errors(mut errors: Vec<OperatorError>) -> OperatorResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(OperatorError::Aggregate(errors)),
        }
    }
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}
