//! Error types for gantry-host
//!
//! Defines host-specific error types using thiserror for clear error
//! propagation.

use thiserror::Error;

/// Main error type for the host
#[derive(Error, Debug)]
pub enum Error {
    /// Shared plumbing errors (config, database, I/O)
    #[error(transparent)]
    Common(#[from] gantry_common::Error),

    /// Registry construction rejected the module set
    #[error("Registry error: {0}")]
    Registry(String),

    /// Lifecycle operation called in a state that cannot accept it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Model initialization or retrieval errors
    #[error("Model error: {0}")]
    Model(String),

    /// Service initialization or retrieval errors
    #[error("Service error: {0}")]
    Service(String),

    /// Data patch execution failed; the host has been torn down
    #[error("Migration error: {0}")]
    Migration(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),
}

/// Convenience Result type using host Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Common(gantry_common::Error::Database(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Common(gantry_common::Error::Io(e))
    }
}
