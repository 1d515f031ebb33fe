//! Error types for the Slurm REST client.

use thiserror::Error;

use crate::client::Capability;

/// Errors that can occur when using the Slurm client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// slurmrestd returned an error response.
    #[error("API error (status {status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from slurmrestd.
        message: String,
    },

    /// Failed to deserialize response.
    #[error("Failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),

    /// Invalid server URL provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The requested object is not present in the response.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// The operation was disabled when the client was built.
    #[error("Capability disabled for this client: {0:?}")]
    Disabled(Capability),
}

impl ClientError {
    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound { .. } => true,
            ClientError::Api { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
