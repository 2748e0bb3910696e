//! Error types for Chronolog

use thiserror::Error;

/// Core error type for Chronolog operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed event or template on the wire. Carries the index of the
    /// offending positional field so the client can point at it.
    #[error("Protocol error in field {field}: {reason}")]
    Protocol { field: usize, reason: String },

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i32, supported: i32 },

    #[error("Another instance owns the socket; use --replace to take over")]
    SocketOwnership,

    #[error("Extension error: {0}")]
    Extension(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a protocol error pointing at a positional field.
    pub fn protocol(field: usize, reason: impl Into<String>) -> Self {
        Error::Protocol {
            field,
            reason: reason.into(),
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
