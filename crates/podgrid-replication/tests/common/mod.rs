//! Shared fakes for replication integration tests.
//!
//! `FakeStore` is an in-memory coordination backend that records every
//! intent write (order, SHA, and commit concurrency) and can simulate an
//! instantly-obedient node agent by mirroring intent into reality on
//! commit. `FakeChecker` serves a mutable health snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podgrid_health::{HealthChecker, HealthError, HealthResult, HealthState, ServiceSnapshot};
use podgrid_manifest::{Manifest, NodeName, PodId};
use podgrid_store::{
    pod_path, CommitOutcome, LabelSet, LabelType, Labeler, PodTree, Session, Store,
    StoreError, StoreResult, Transaction, TxnOp,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeStoreState {
    pods: Mutex<HashMap<String, Manifest>>,
    labels: Mutex<HashMap<String, LabelSet>>,
    locks: Mutex<HashMap<String, (String, String)>>,
    sessions: Mutex<HashMap<String, String>>,
    session_seq: AtomicUsize,

    intent_writes: AtomicUsize,
    write_order: Mutex<Vec<NodeName>>,
    write_shas: Mutex<Vec<(NodeName, String)>>,
    concurrent_commits: AtomicUsize,
    max_concurrent_commits: AtomicUsize,

    renewal_senders: Mutex<Vec<mpsc::Sender<StoreError>>>,
    destroyed_sessions: Mutex<Vec<String>>,

    /// Nodes whose reality never updates, to exercise timeouts.
    stuck_nodes: Mutex<HashSet<NodeName>>,
}

impl FakeStoreState {
    fn remove_session(&self, id: &str) -> bool {
        let existed = self.sessions.lock().unwrap().remove(id).is_some();
        if existed {
            self.locks
                .lock()
                .unwrap()
                .retain(|_, (_, session_id)| session_id != id);
            self.destroyed_sessions
                .lock()
                .unwrap()
                .push(id.to_string());
        }
        existed
    }
}

/// In-memory backend. Committed intent writes are mirrored into reality
/// (as if the node agent picked them up instantly) unless the node was
/// marked stuck.
pub struct FakeStore {
    state: Arc<FakeStoreState>,
    commit_sleep: Duration,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Self::with_commit_sleep(Duration::ZERO)
    }

    pub fn with_commit_sleep(sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(FakeStoreState::default()),
            commit_sleep: sleep,
        })
    }

    /// Pre-populate a node's reality entry.
    pub fn set_reality(&self, node: &NodeName, manifest: &Manifest) {
        let key = pod_path(PodTree::Reality, node, manifest.id());
        self.state.pods.lock().unwrap().insert(key, manifest.clone());
    }

    pub fn reality_sha(&self, node: &NodeName, pod: &PodId) -> Option<String> {
        let key = pod_path(PodTree::Reality, node, pod);
        self.state
            .pods
            .lock()
            .unwrap()
            .get(&key)
            .map(|m| m.sha().to_string())
    }

    pub fn mark_stuck(&self, node: &NodeName) {
        self.state.stuck_nodes.lock().unwrap().insert(node.clone());
    }

    pub fn label_pod(&self, key: &str, labels: LabelSet) {
        self.state
            .labels
            .lock()
            .unwrap()
            .insert(format!("{}/{key}", LabelType::Pod), labels);
    }

    pub fn pod_labels(&self, key: &str) -> Option<LabelSet> {
        self.state
            .labels
            .lock()
            .unwrap()
            .get(&format!("{}/{key}", LabelType::Pod))
            .cloned()
    }

    pub fn intent_writes(&self) -> usize {
        self.state.intent_writes.load(Ordering::SeqCst)
    }

    pub fn write_order(&self) -> Vec<NodeName> {
        self.state.write_order.lock().unwrap().clone()
    }

    pub fn write_shas(&self) -> Vec<(NodeName, String)> {
        self.state.write_shas.lock().unwrap().clone()
    }

    pub fn max_concurrent_commits(&self) -> usize {
        self.state.max_concurrent_commits.load(Ordering::SeqCst)
    }

    pub fn destroyed_sessions(&self) -> Vec<String> {
        self.state.destroyed_sessions.lock().unwrap().clone()
    }

    /// Inject a renewal failure into the most recent session.
    pub async fn fail_renewal(&self, detail: &str) {
        let sender = self
            .state
            .renewal_senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session created yet");
        sender
            .send(StoreError::SessionRenewal(detail.to_string()))
            .await
            .expect("renewal receiver dropped");
    }
}

struct FakeSession {
    id: String,
    name: String,
    state: Arc<FakeStoreState>,
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn lock(&self, path: &str) -> StoreResult<()> {
        if !self.state.sessions.lock().unwrap().contains_key(&self.id) {
            return Err(StoreError::NoSuchSession(self.id.clone()));
        }
        let mut locks = self.state.locks.lock().unwrap();
        if let Some((_, holder_id)) = locks.get(path) {
            if holder_id != &self.id {
                return Err(StoreError::AlreadyLocked {
                    path: path.to_string(),
                });
            }
        }
        locks.insert(path.to_string(), (self.name.clone(), self.id.clone()));
        Ok(())
    }

    async fn destroy(&self) -> StoreResult<()> {
        self.state.remove_session(&self.id);
        Ok(())
    }
}

#[async_trait]
impl Store for FakeStore {
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
        match self.state.pods.lock().unwrap().get(&key) {
            Some(manifest) => Ok((manifest.clone(), Duration::ZERO)),
            None => Err(StoreError::NoCurrentManifest),
        }
    }

    async fn commit_with_retries(&self, txn: &Transaction) -> StoreResult<CommitOutcome> {
        let in_flight = self.state.concurrent_commits.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_concurrent_commits
            .fetch_max(in_flight, Ordering::SeqCst);

        if self.commit_sleep > Duration::ZERO {
            tokio::time::sleep(self.commit_sleep).await;
        }

        for op in txn.ops() {
            match op {
                TxnOp::SetPod {
                    tree,
                    node,
                    manifest,
                } => {
                    let key = pod_path(*tree, node, manifest.id());
                    self.state
                        .pods
                        .lock()
                        .unwrap()
                        .insert(key, manifest.clone());
                    if *tree == PodTree::Intent {
                        self.state.intent_writes.fetch_add(1, Ordering::SeqCst);
                        self.state.write_order.lock().unwrap().push(node.clone());
                        self.state
                            .write_shas
                            .lock()
                            .unwrap()
                            .push((node.clone(), manifest.sha().to_string()));
                        let stuck = self.state.stuck_nodes.lock().unwrap().contains(node);
                        if !stuck {
                            let reality = pod_path(PodTree::Reality, node, manifest.id());
                            self.state
                                .pods
                                .lock()
                                .unwrap()
                                .insert(reality, manifest.clone());
                        }
                    }
                }
                TxnOp::SetLabels {
                    label_type,
                    id,
                    labels,
                } => {
                    self.state
                        .labels
                        .lock()
                        .unwrap()
                        .insert(format!("{label_type}/{id}"), labels.clone());
                }
            }
        }

        self.state.concurrent_commits.fetch_sub(1, Ordering::SeqCst);
        Ok(CommitOutcome::Committed)
    }

    async fn new_session(
        &self,
        name: &str,
    ) -> StoreResult<(Box<dyn Session>, mpsc::Receiver<StoreError>)> {
        let seq = self.state.session_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-session-{seq}");
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(id.clone(), name.to_string());
        let (renewal_tx, renewal_rx) = mpsc::channel(1);
        self.state
            .renewal_senders
            .lock()
            .unwrap()
            .push(renewal_tx);
        let session = FakeSession {
            id,
            name: name.to_string(),
            state: self.state.clone(),
        };
        Ok((Box::new(session), renewal_rx))
    }

    async fn lock_holder(&self, path: &str) -> StoreResult<(String, String)> {
        match self.state.locks.lock().unwrap().get(path) {
            Some((name, id)) => Ok((name.clone(), id.clone())),
            None => Ok((String::new(), String::new())),
        }
    }

    async fn destroy_lock_holder(&self, session_id: &str) -> StoreResult<()> {
        if !self.state.remove_session(session_id) {
            return Err(StoreError::NoSuchSession(session_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Labeler for FakeStore {
    async fn get_labels(&self, label_type: LabelType, id: &str) -> StoreResult<LabelSet> {
        Ok(self
            .state
            .labels
            .lock()
            .unwrap()
            .get(&format!("{label_type}/{id}"))
            .cloned()
            .unwrap_or_default())
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

/// Serves a mutable health snapshot, one-shot and streaming.
pub struct FakeChecker {
    snapshot: Mutex<ServiceSnapshot>,
    fail_service: AtomicBool,
}

impl FakeChecker {
    pub fn all_with_status(nodes: &[&str], status: HealthState) -> Arc<Self> {
        Self::with_statuses(
            &nodes
                .iter()
                .map(|name| (*name, status))
                .collect::<Vec<_>>(),
        )
    }

    pub fn with_statuses(entries: &[(&str, HealthState)]) -> Arc<Self> {
        let snapshot = entries
            .iter()
            .map(|(name, status)| make_result(name, *status))
            .collect();
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            fail_service: AtomicBool::new(false),
        })
    }

    pub fn failing_service_fetch() -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(ServiceSnapshot::new()),
            fail_service: AtomicBool::new(true),
        })
    }

}

fn make_result(name: &str, status: HealthState) -> (NodeName, HealthResult) {
    let node = NodeName::from(name);
    (
        node.clone(),
        HealthResult {
            node,
            service: "test".to_string(),
            check_id: String::new(),
            status,
        },
    )
}

#[async_trait]
impl HealthChecker for FakeChecker {
    async fn service(&self, service_id: &str) -> Result<ServiceSnapshot, HealthError> {
        if self.fail_service.load(Ordering::SeqCst) {
            return Err(HealthError::Resolve {
                service: service_id.to_string(),
                detail: "health backend unavailable".to_string(),
            });
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn watch_service(
        &self,
        token: CancellationToken,
        _service_id: &str,
        result_tx: mpsc::Sender<ServiceSnapshot>,
        _err_tx: mpsc::Sender<HealthError>,
        _watch_delay: Duration,
    ) {
        loop {
            let snapshot = self.snapshot.lock().unwrap().clone();
            tokio::select! {
                _ = token.cancelled() => return,
                sent = result_tx.send(snapshot) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

/// Build a manifest whose SHA varies with `version`.
pub fn make_manifest(pod: &str, version: &str) -> Manifest {
    Manifest::builder(pod)
        .stanza(
            "launchables",
            serde_yaml::from_str(&format!("app: file:///{pod}_{version}.tar.gz")).unwrap(),
        )
        .build()
        .unwrap()
}

/// Poll `condition` until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) {
    let started = std::time::Instant::now();
    while !condition() {
        if started.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
