//! Error types for the coordination backend.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Sentinel: the node has no manifest at the queried key yet.
    #[error("no current manifest")]
    NoCurrentManifest,

    /// Sentinel: the lock is held by another session.
    #[error("lock at {path} already held")]
    AlreadyLocked { path: String },

    #[error("session {0} does not exist")]
    NoSuchSession(String),

    #[error("session renewal failed: {0}")]
    SessionRenewal(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Manifest(#[from] podgrid_manifest::ManifestError),
}

impl StoreError {
    /// Whether this is the "no current manifest" sentinel.
    pub fn is_no_current_manifest(&self) -> bool {
        matches!(self, StoreError::NoCurrentManifest)
    }

    /// Whether this is the "already locked" sentinel.
    pub fn is_already_locked(&self) -> bool {
        matches!(self, StoreError::AlreadyLocked { .. })
    }
}
