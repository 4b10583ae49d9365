use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the crate's public API.
///
/// Internal plumbing uses `anyhow::Error` at call sites the way
/// `pbs-datastore` does (`chunk_store.rs`, `datastore.rs`); this enum is the
/// boundary type callers match on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid id presented to put operation{}", .0.as_ref().map(|p| format!(" ({p})")).unwrap_or_default())]
    InvalidId(Option<String>),

    #[error("decryption failed for object {0}")]
    DecryptFailed(String),

    #[error("failed to write object {path}: {source}")]
    StorePut {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read object {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cloud repository is locked by another device")]
    CloudLocked,

    #[error("locking cloud repository failed: {0}")]
    LockCloudFailed(String),

    #[error("cloud storage quota exceeded")]
    StorageSizeExceeded,

    #[error("cloud authentication failed")]
    CloudAuthFailed,

    #[error("system time is incorrect")]
    SystemTimeIncorrect,

    #[error("network error: {0}")]
    Network(String),

    #[error("generating conflict history failed for {0}")]
    GenerateConflictHistory(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Escape hatch for anything not covered by a specific kind above,
    /// preserving the underlying cause the way call sites throughout
    /// `pbs-datastore` do with `anyhow::format_err!`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
