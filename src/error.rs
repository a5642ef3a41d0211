//! ConfSync Error Types

use thiserror::Error;

/// Result type alias for ConfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// ConfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Store errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    // Cluster errors
    #[error("Slave not found: {0}")]
    SlaveNotFound(String),

    #[error("Not master: this operation requires the master node")]
    NotMaster,

    // Network errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Notification errors
    #[error("Authentication rejected")]
    Authentication,

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Frame serialization error: {0}")]
    FrameSerialization(#[from] bincode::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Transport(_)
        )
    }
}
