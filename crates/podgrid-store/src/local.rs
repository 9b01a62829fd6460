//! LocalStore — redb-backed coordination backend for a single process.
//!
//! Implements the full `Store`/`Session`/`Labeler` surface over redb tables,
//! with on-disk and in-memory backends (the latter for testing). Local
//! sessions have no lease to renew, so the renewal-error channel stays
//! silent; locks, holders, and forced holder destruction behave exactly as
//! the clustered backend's do, which keeps the lock-override flow testable
//! without a cluster.

use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use podgrid_manifest::{Manifest, NodeName, PodId};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{Labeler, Session, Store};
use crate::tables::{LABELS, LOCKS, PODS, SESSIONS};
use crate::txn::{CommitOutcome, Transaction, TxnOp};
use crate::types::{pod_path, LabelSet, LabelType, PodTree};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Who holds a lock, as stored in the locks table.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    session_id: String,
    name: String,
}

/// Thread-safe local coordination backend backed by redb.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    session_seq: Arc<AtomicU64>,
}

impl LocalStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            session_seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        debug!(?path, "local store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            session_seq: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        debug!("in-memory local store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.open_table(LABELS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Apply a whole transaction in one redb write transaction.
    fn apply(&self, batch: &Transaction) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
            let mut labels = txn.open_table(LABELS).map_err(map_err!(Table))?;
            for op in batch.ops() {
                match op {
                    TxnOp::SetPod {
                        tree,
                        node,
                        manifest,
                    } => {
                        let key = pod_path(*tree, node, manifest.id());
                        pods.insert(key.as_str(), manifest.raw_bytes())
                            .map_err(map_err!(Write))?;
                    }
                    TxnOp::SetLabels {
                        label_type,
                        id,
                        labels: set,
                    } => {
                        let key = format!("{label_type}/{id}");
                        let value =
                            serde_json::to_vec(set).map_err(map_err!(Serialize))?;
                        labels
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ops = batch.len(), "transaction committed");
        Ok(())
    }

    fn session_exists(&self, id: &str) -> StoreResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        Ok(table.get(id).map_err(map_err!(Read))?.is_some())
    }

    /// Remove a session and every lock it holds. Returns whether it existed.
    fn remove_session(&self, id: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            existed = sessions.remove(id).map_err(map_err!(Write))?.is_some();

            let mut locks = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let mut held = Vec::new();
            for entry in locks.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let lock: LockEntry = serde_json::from_slice(value.value())
                    .map_err(map_err!(Deserialize))?;
                if lock.session_id == id {
                    held.push(key.value().to_string());
                }
            }
            for path in held {
                locks.remove(path.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            debug!(session = %id, "session destroyed");
        }
        Ok(existed)
    }

    fn try_lock(&self, session_id: &str, session_name: &str, path: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            if sessions
                .get(session_id)
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StoreError::NoSuchSession(session_id.to_string()));
            }
            drop(sessions);

            let mut locks = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            if let Some(existing) = locks.get(path).map_err(map_err!(Read))? {
                let entry: LockEntry = serde_json::from_slice(existing.value())
                    .map_err(map_err!(Deserialize))?;
                if entry.session_id != session_id {
                    return Err(StoreError::AlreadyLocked {
                        path: path.to_string(),
                    });
                }
            }
            let entry = LockEntry {
                session_id: session_id.to_string(),
                name: session_name.to_string(),
            };
            let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            locks
                .insert(path, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(session = %session_id, %path, "lock acquired");
        Ok(())
    }

    fn next_session_id(&self, name: &str) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        epoch_secs().hash(&mut hasher);
        self.session_seq.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
        format!("session-{:016x}", hasher.finish())
    }
}

/// A session on a `LocalStore`.
///
/// Keeps the renewal-error sender alive so the caller's receiver stays open
/// for the life of the session without ever yielding a value.
struct LocalSession {
    id: String,
    name: String,
    store: LocalStore,
    _renewal_tx: mpsc::Sender<StoreError>,
}

#[async_trait]
impl Session for LocalSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn lock(&self, path: &str) -> StoreResult<()> {
        self.store.try_lock(&self.id, &self.name, path)
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.store.remove_session(&self.id)?;
        Ok(())
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn set_pod_txn(
        &self,
        txn: &mut Transaction,
        tree: PodTree,
        node: &NodeName,
        manifest: &Manifest,
    ) -> StoreResult<()> {
        txn.push(TxnOp::SetPod {
            tree,
            node: node.clone(),
            manifest: manifest.clone(),
        });
        Ok(())
    }

    async fn pod(
        &self,
        tree: PodTree,
        node: &NodeName,
        pod: &PodId,
    ) -> StoreResult<(Manifest, Duration)> {
        let key = pod_path(tree, node, pod);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let manifest = Manifest::from_yaml_bytes(guard.value().to_vec())?;
                // Local entries do not expire.
                Ok((manifest, Duration::ZERO))
            }
            None => Err(StoreError::NoCurrentManifest),
        }
    }

    async fn commit_with_retries(&self, txn: &Transaction) -> StoreResult<CommitOutcome> {
        // redb write transactions serialize against each other, so a local
        // commit cannot lose a compare-and-set race.
        self.apply(txn)?;
        Ok(CommitOutcome::Committed)
    }

    async fn new_session(
        &self,
        name: &str,
    ) -> StoreResult<(Box<dyn Session>, mpsc::Receiver<StoreError>)> {
        let id = self.next_session_id(name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            sessions
                .insert(id.as_str(), name)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        let (renewal_tx, renewal_rx) = mpsc::channel(1);
        debug!(session = %id, %name, "session created");
        let session = LocalSession {
            id,
            name: name.to_string(),
            store: self.clone(),
            _renewal_tx: renewal_tx,
        };
        Ok((Box::new(session), renewal_rx))
    }

    async fn lock_holder(&self, path: &str) -> StoreResult<(String, String)> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(path).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: LockEntry = serde_json::from_slice(guard.value())
                    .map_err(map_err!(Deserialize))?;
                Ok((entry.name, entry.session_id))
            }
            None => Ok((String::new(), String::new())),
        }
    }

    async fn destroy_lock_holder(&self, session_id: &str) -> StoreResult<()> {
        if !self.remove_session(session_id)? {
            return Err(StoreError::NoSuchSession(session_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Labeler for LocalStore {
    async fn get_labels(&self, label_type: LabelType, id: &str) -> StoreResult<LabelSet> {
        let key = format!("{label_type}/{id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LABELS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Ok(LabelSet::new()),
        }
    }

    async fn set_labels_txn(
        &self,
        txn: &mut Transaction,
        label_type: LabelType,
        id: &str,
        labels: LabelSet,
    ) -> StoreResult<()> {
        txn.push(TxnOp::SetLabels {
            label_type,
            id: id.to_string(),
            labels,
        });
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
