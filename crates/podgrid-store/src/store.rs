//! The `Store`, `Session`, and `Labeler` traits.
//!
//! These are the seams between the replication engine and whatever
//! coordination backend a deployment uses. [`crate::LocalStore`] implements
//! all three for a single process; a clustered backend implements them over
//! its own wire protocol.

use std::time::Duration;

use async_trait::async_trait;
use podgrid_manifest::{Manifest, NodeName, PodId};
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};
use crate::txn::{CommitOutcome, Transaction};
use crate::types::{LabelSet, LabelType, PodTree};

/// A renewable lease on the coordination backend. Owning a session owns the
/// locks acquired through it; destroying the session releases them.
#[async_trait]
pub trait Session: Send + Sync {
    /// Backend identity of this session.
    fn id(&self) -> &str;

    /// Acquire the exclusive lock at `path`.
    ///
    /// Returns [`StoreError::AlreadyLocked`] when another session holds it.
    /// There is no unlock: locks live exactly as long as the session.
    async fn lock(&self, path: &str) -> StoreResult<()>;

    /// Destroy the session, releasing every lock it holds.
    async fn destroy(&self) -> StoreResult<()>;
}

/// The coordination backend: pod trees, transactions, sessions, locks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a manifest-write to `txn`.
    async fn set_pod_txn(
        &self,
        txn: &mut Transaction,
        tree: PodTree,
        node: &NodeName,
        manifest: &Manifest,
    ) -> StoreResult<()>;

    /// Read the manifest a tree currently holds for a node.
    ///
    /// The duration is the remaining TTL of the entry, where the backend
    /// tracks one. Returns [`StoreError::NoCurrentManifest`] when the key
    /// does not exist.
    async fn pod(
        &self,
        tree: PodTree,
        node: &NodeName,
        pod: &PodId,
    ) -> StoreResult<(Manifest, Duration)>;

    /// Commit `txn` atomically, retrying transient backend failures until
    /// the caller cancels the future. A compare-and-set loss resolves to
    /// [`CommitOutcome::Conflict`], not an error.
    async fn commit_with_retries(&self, txn: &Transaction) -> StoreResult<CommitOutcome>;

    /// Create a session named `name`.
    ///
    /// The returned receiver is the renewal-error channel: a value on it
    /// means the backend could not renew the session's lease, so every lock
    /// the session held must be presumed lost.
    async fn new_session(
        &self,
        name: &str,
    ) -> StoreResult<(Box<dyn Session>, mpsc::Receiver<StoreError>)>;

    /// Report who holds the lock at `path` as `(holder_name, session_id)`.
    ///
    /// An empty holder name means nobody holds it but acquisition is blocked
    /// by a lock delay left behind by a previous holder.
    async fn lock_holder(&self, path: &str) -> StoreResult<(String, String)>;

    /// Force-destroy the session with the given id, releasing its locks.
    async fn destroy_lock_holder(&self, session_id: &str) -> StoreResult<()>;
}

/// Read and write object labels.
#[async_trait]
pub trait Labeler: Send + Sync {
    async fn get_labels(&self, label_type: LabelType, id: &str) -> StoreResult<LabelSet>;

    /// Append a label-write to `txn`.
    async fn set_labels_txn(
        &self,
        txn: &mut Transaction,
        label_type: LabelType,
        id: &str,
        labels: LabelSet,
    ) -> StoreResult<()>;
}
