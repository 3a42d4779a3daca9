//! Error handling for gpu-guard
//!
//! Provides the error and result types shared by the core and engine crates.

/// Result type alias for gpu-guard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for gpu-guard
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Topology source or snapshot errors
    #[error("Topology error: {0}")]
    Topology(String),

    /// Malformed observation input
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Tenant state machine errors
    #[error("State error: {0}")]
    State(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    /// Create an invalid observation error
    pub fn invalid_observation(msg: impl Into<String>) -> Self {
        Self::InvalidObservation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::Topology(_) => "topology",
            Error::InvalidObservation(_) => "invalid_observation",
            Error::NotFound(_) => "not_found",
            Error::State(_) => "state",
            Error::Io(_) => "io",
            Error::Yaml(_) => "yaml",
            Error::Other(_) => "other",
        }
    }
}
