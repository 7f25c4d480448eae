//! Error types
//!
//! Only configuration problems and unrecoverable setup I/O surface as
//! `SearchError`. Per-key oracle failures, corrupt node blobs and corrupt
//! checkpoints are absorbed where they happen and logged.

use crate::range::Key;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = SearchError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("inverted range: lower {lower} > upper {upper}")]
    InvertedRange { lower: Key, upper: Key },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid target fingerprint {fingerprint:?}: {reason}")]
    InvalidTarget { fingerprint: String, reason: String },

    #[error("storage I/O failed at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint encoding failed: {0}")]
    CheckpointEncoding(#[from] serde_json::Error),

    #[error("external delegate unavailable: {0}")]
    Delegate(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),
}

impl SearchError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SearchError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Failure to fingerprint a single key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("key {0} is outside the oracle's domain")]
    OutOfDomain(Key),

    #[error("fingerprint of key {key} is {actual} hex characters wide, expected {expected}")]
    WidthMismatch { key: Key, expected: usize, actual: usize },
}
