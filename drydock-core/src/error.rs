//! Error taxonomy for the transformation engine.
//!
//! Errors are classified by how the writer loop reacts to them:
//! invalid-JSON triggers a fetch-and-reset, cancellation is reported as
//! such, public errors are safe to show to a caller, and everything else
//! is internal.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The request was rejected before any write happened.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A JSON file in the tree is structurally broken. The writer reacts
    /// to this by fetching the remote and resetting the branch once.
    #[error("{path}: JSON file is not valid")]
    InvalidJson { path: String },

    /// A locks directory contains a plain file where only lock
    /// directories are allowed.
    #[error("found file {path} in a locks directory, expected only lock directories")]
    LocksDirectoryFile { path: String },

    /// The request's cancellation token fired or a deadline elapsed.
    #[error("operation cancelled")]
    Cancelled,

    /// A failure whose message is safe to show to a caller.
    #[error("{0}")]
    Public(String),

    /// Anything else. Logged with detail, reported opaquely.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }

    /// True for the structural-tree error the writer recovers from.
    pub fn is_invalid_json(&self) -> bool {
        matches!(self, Error::InvalidJson { .. })
    }
}

impl From<crate::treefs::FsError> for Error {
    fn from(err: crate::treefs::FsError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crate::store::StoreError> for Error {
    fn from(err: crate::store::StoreError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
