//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid schedule '{expression}': {reason}")]
    Schedule { expression: String, reason: String },

    #[error("Connector initialization failed: {0}")]
    Initialization(String),

    #[error("Service already started")]
    AlreadyStarted,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Automatic restart failed: {0}")]
    RestartFailed(String),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Feed push failed: {0}")]
    Push(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Invalid document id: {0}")]
    InvalidDocId(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn schedule(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schedule {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn connector(msg: impl std::fmt::Display) -> Self {
        Self::Connector(msg.to_string())
    }

    pub fn push(msg: impl Into<String>) -> Self {
        Self::Push(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }
}
