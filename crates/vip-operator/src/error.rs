//! Error types for the VIP operator

use thiserror::Error;

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Operator error types
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A watch event payload could not be interpreted as an Endpoints object
    #[error("Unable to decode endpoints from watch event: {0}")]
    DecodeError(String),

    /// Annotation update kept conflicting until retries ran out
    #[error("Annotation update on {service} conflicted after {attempts} attempts")]
    AnnotationConflict { service: String, attempts: u32 },

    /// Leader election failure
    #[error("Leader election failed: {0}")]
    ElectionError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl OperatorError {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeError(msg.into())
    }

    /// Create an election error
    pub fn election(msg: impl Into<String>) -> Self {
        Self::ElectionError(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether this is an optimistic-concurrency conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// Whether the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}
