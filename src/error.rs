//! Error types for clabd

use thiserror::Error;

/// Result type alias using clabd's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for clabd
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sandbox could not be provisioned for a request
    #[error("Provisioning error: {0}")]
    Provision(String),

    /// Sandbox execution error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Critique service error
    #[error("Critique error: {0}")]
    Critique(String),

    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Fatal errors terminate the server; everything else is contained to
    /// the single request or session that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
