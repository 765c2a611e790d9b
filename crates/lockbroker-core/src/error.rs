//! Error types for Lockbroker

use crate::domain::locking::LockError;
use thiserror::Error;

/// Result type alias using Lockbroker's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Lockbroker error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Broker errors (E100-E999)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Client errors (E1000-E1099)
    #[error("The lockbroker rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Unable to communicate with the lockbroker: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected response from the lockbroker: {0}")]
    Protocol(String),

    // Config errors (E1100-E1199)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &str {
        match self {
            Self::Lock(e) => e.code(),
            Self::Rejected { code, .. } => code.as_str(),
            Self::Network(_) => "E1000",
            Self::Protocol(_) => "E1001",
            Self::ConfigError(_) => "E1100",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Network(_) => Some("Check that `lockbroker serve` is running and reachable".to_string()),
            Self::Rejected { code, .. } if code == "E100" => {
                Some("Release held locks before requesting more; user locks must come before node locks".to_string())
            }
            Self::ConfigError(_) => Some("lockbroker config show".to_string()),
            _ => None,
        }
    }
}
