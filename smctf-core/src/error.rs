//! Error types for the stack control plane.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The first five variants are the sentinels the HTTP layer maps to
//! status codes; everything else is an internal failure.

use thiserror::Error;

/// Result type alias for stack operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Main error type for the stack control plane.
#[derive(Error, Debug)]
pub enum StackError {
    #[error("stack not found")]
    NotFound,

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("pod spec invalid: {reason}")]
    PodSpecInvalid { reason: String },

    #[error("no available node port")]
    NoAvailableNodePort,

    #[error("cluster saturated: {reason}")]
    ClusterSaturated { reason: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Collaborator failures
    #[error("repository error: {0}")]
    Repository(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StackError {
    /// Create an `InvalidInput` error from a reason.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput { reason: reason.into() }
    }

    /// Create a `PodSpecInvalid` error from a reason.
    pub fn pod_spec_invalid(reason: impl Into<String>) -> Self {
        Self::PodSpecInvalid { reason: reason.into() }
    }

    /// Create a `ClusterSaturated` error from a reason.
    pub fn saturated(reason: impl Into<String>) -> Self {
        Self::ClusterSaturated { reason: reason.into() }
    }

    /// Create an `Internal` error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
