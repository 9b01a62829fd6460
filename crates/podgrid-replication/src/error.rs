//! Replication error taxonomy.
//!
//! Errors reach callers on the run's error channel as [`ReplicationError`],
//! which carries whether the error halted the whole run. Inside the engine,
//! per-node updates fail with the finer-grained [`UpdateError`]; only some
//! of its variants are worth reporting (timeouts and cancellations are a
//! normal part of a run's life and are logged instead).

use podgrid_store::StoreError;
use thiserror::Error;

/// An error reported by a replication run.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct ReplicationError {
    #[source]
    cause: Box<dyn std::error::Error + Send + Sync>,
    fatal: bool,
}

impl ReplicationError {
    pub(crate) fn fatal(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            cause: cause.into(),
            fatal: true,
        }
    }

    pub(crate) fn non_fatal(
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            cause: cause.into(),
            fatal: false,
        }
    }

    /// Whether this error halted the replication, as opposed to failing a
    /// single node.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

/// How a single node's update ended, when it didn't succeed.
#[derive(Debug, Error)]
pub(crate) enum UpdateError {
    #[error("node update timed out")]
    Timeout,

    #[error("replication was cancelled")]
    Cancelled,

    #[error("replication is shutting down")]
    Quit,

    #[error("transaction conflict writing intent store: {0}")]
    Conflict(String),

    #[error("could not build intent transaction: {0}")]
    Build(#[source] StoreError),

    #[error("could not commit intent transaction: {0}")]
    Commit(#[source] StoreError),

    #[error("timed out waiting for a reality query slot")]
    RealityStarved,

    #[error(transparent)]
    Store(#[from] StoreError),
}
