//! A single replication run.
//!
//! `Replication` owns the worker pool that drives each node to the target
//! manifest. Nodes are released into the pool in worst-health-first order
//! (optionally gated by a rate limiter), and each worker runs the per-node
//! update: write intent transactionally, wait for the node's reality to
//! report the target SHA, then wait for its health to reach the threshold.
//!
//! Two teardown signals exist and are deliberately not collapsed: the
//! *cancelled* token is the caller asking the run to stop, and the *quit*
//! token is the end-handler tearing the run down (after a completed or
//! cancelled run, or on lock loss). Teardown must wait for enactment to
//! drain before the lock session is destroyed, which is only possible when
//! the two signals are distinct.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use podgrid_health::{HealthChecker, HealthState};
use podgrid_manifest::{pod_label_key, Manifest, NodeName, PodId};
use podgrid_store::{
    CommitOutcome, LabelSet, LabelType, Labeler, PodTree, Store, StoreError, Transaction,
};
use tokio::sync::{mpsc, Mutex as TokioMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::PodHealth;
use crate::error::{ReplicationError, UpdateError};
use crate::order;

/// Default period between reality polls while waiting for a node to pick up
/// its intent.
pub const DEFAULT_REALITY_POLL_PERIOD: Duration = Duration::from_millis(5000);

/// Default period between health polls while waiting for a node to become
/// healthy.
pub const DEFAULT_HEALTH_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// How long a reality query waits for a semaphore slot before logging
/// progress, and before giving up entirely.
const REALITY_SLOT_PROGRESS: Duration = Duration::from_secs(5);
const REALITY_SLOT_DEADLINE: Duration = Duration::from_secs(60);

/// The mutable deploy target: swapped whole under one writer lock so later
/// nodes can be retargeted without tearing the run down.
struct RunTarget {
    manifest: Manifest,
    timeout: Option<Duration>,
}

pub(crate) struct ReplicationInner {
    active: usize,
    nodes: Vec<NodeName>,
    completed_count: AtomicU32,
    store: Arc<dyn Store>,
    labeler: Arc<dyn Labeler>,
    health: Arc<dyn HealthChecker>,
    threshold: HealthState,
    pod_labels: LabelSet,
    rate_limit: Option<Duration>,
    err_tx: mpsc::Sender<ReplicationError>,
    target: StdRwLock<RunTarget>,
    timed_out: StdMutex<Vec<NodeName>>,
    reality_permits: Arc<Semaphore>,
    health_watch_delay: Duration,
    reality_poll_period: Duration,
    health_poll_period: Duration,
    /// Externally supplied node queue, if any. Taken once by `enact`.
    node_queue: StdMutex<Option<mpsc::Receiver<NodeName>>>,
    external_queue: bool,

    pub(crate) cancelled: CancellationToken,
    pub(crate) done: CancellationToken,
    pub(crate) quit: CancellationToken,
    pub(crate) enacted: CancellationToken,
    pub(crate) enact_started: AtomicBool,
}

/// Everything a run needs, gathered by the `Replicator`.
pub(crate) struct ReplicationParams {
    pub active: usize,
    pub nodes: Vec<NodeName>,
    pub store: Arc<dyn Store>,
    pub labeler: Arc<dyn Labeler>,
    pub health: Arc<dyn HealthChecker>,
    pub manifest: Manifest,
    pub threshold: HealthState,
    pub pod_labels: LabelSet,
    pub rate_limit: Option<Duration>,
    pub err_tx: mpsc::Sender<ReplicationError>,
    pub concurrent_reality_requests: usize,
    pub timeout: Option<Duration>,
    pub health_watch_delay: Duration,
    pub reality_poll_period: Duration,
    pub health_poll_period: Duration,
    pub node_queue: Option<mpsc::Receiver<NodeName>>,
}

/// Handle to one replication run. Cloning shares the run.
#[derive(Clone)]
pub struct Replication {
    inner: Arc<ReplicationInner>,
}

impl std::fmt::Debug for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication").finish_non_exhaustive()
    }
}

impl Replication {
    pub(crate) fn new(params: ReplicationParams) -> Self {
        let external_queue = params.node_queue.is_some();
        Self {
            inner: Arc::new(ReplicationInner {
                active: params.active.max(1),
                nodes: params.nodes,
                completed_count: AtomicU32::new(0),
                store: params.store,
                labeler: params.labeler,
                health: params.health,
                threshold: params.threshold,
                pod_labels: params.pod_labels,
                rate_limit: params.rate_limit,
                err_tx: params.err_tx,
                target: StdRwLock::new(RunTarget {
                    manifest: params.manifest,
                    timeout: params.timeout,
                }),
                timed_out: StdMutex::new(Vec::new()),
                reality_permits: Arc::new(Semaphore::new(
                    params.concurrent_reality_requests.max(1),
                )),
                health_watch_delay: params.health_watch_delay,
                reality_poll_period: params.reality_poll_period,
                health_poll_period: params.health_poll_period,
                node_queue: StdMutex::new(params.node_queue),
                external_queue,
                cancelled: CancellationToken::new(),
                done: CancellationToken::new(),
                quit: CancellationToken::new(),
                enacted: CancellationToken::new(),
                enact_started: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn inner(&self) -> Arc<ReplicationInner> {
        self.inner.clone()
    }

    /// Run the replication to completion (or cancellation / teardown).
    ///
    /// Closes the enacted signal and then the done signal before returning,
    /// in that order, so cancellers waiting on enactment drain observe the
    /// workers gone before the end-handler frees resources.
    pub async fn enact(&self) {
        let inner = self.inner.clone();
        inner.enact_started.store(true, Ordering::SeqCst);
        let _finished = EnactedGuard {
            inner: inner.clone(),
        };

        let manifest = inner.manifest();
        let pod = manifest.id().clone();

        // Health at replication start seeds the rollout order. The ordering
        // is not re-sorted as live health changes, which keeps worker
        // fairness deterministic.
        let health_results = match inner.health.service(pod.as_str()).await {
            Ok(results) => results,
            Err(e) => {
                let err = ReplicationError::fatal(format!(
                    "could not fetch initial service health for {pod}: {e}"
                ));
                tokio::select! {
                    _ = inner.err_tx.send(err) => {}
                    _ = inner.quit.cancelled() => {}
                }
                return;
            }
        };
        let mut nodes = inner.nodes.clone();
        order::sort_for_rollout(&mut nodes, &health_results);
        debug!(pod = %pod, nodes = nodes.len(), "rollout order computed");

        let queue_rx = match inner.node_queue.lock().unwrap().take() {
            Some(external) => external,
            None => {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(feed_nodes(inner.clone(), nodes, tx));
                rx
            }
        };

        let aggregate =
            PodHealth::start(pod.clone(), inner.health.clone(), inner.health_watch_delay)
                .await;

        let queue = Arc::new(TokioMutex::new(queue_rx));
        let mut pool = JoinSet::new();
        for _ in 0..inner.active {
            pool.spawn(worker_loop(
                inner.clone(),
                queue.clone(),
                aggregate.clone(),
            ));
        }
        while pool.join_next().await.is_some() {}
        aggregate.stop();
        info!(pod = %pod, "replication enactment finished");
    }

    /// Ask the run to stop. New nodes stop being released immediately;
    /// in-flight node updates abort at their next poll.
    ///
    /// Runs built on an external node queue are cancelled by closing that
    /// queue instead; the run does not own it and will not close it.
    pub fn cancel(&self) {
        if self.inner.external_queue {
            warn!("replication uses an external node queue; close the queue to cancel");
            return;
        }
        self.inner.cancelled.cancel();
    }

    /// Block until the run has been fully torn down (lock session destroyed,
    /// all workers gone).
    pub async fn wait_for_replication(&self) {
        self.inner.quit.cancelled().await;
    }

    /// Number of nodes for which an intent write was issued this run.
    /// Resets to zero when the manifest is swapped for a different one.
    pub fn completed_count(&self) -> u32 {
        self.inner.completed_count.load(Ordering::SeqCst)
    }

    /// Whether the run is still alive (teardown has not finished).
    pub fn in_progress(&self) -> bool {
        !self.inner.quit.is_cancelled()
    }

    /// Swap the target manifest. Nodes whose updaters have not yet started
    /// deploy the new manifest; if the content hash changed, the completed
    /// count resets to zero.
    pub fn set_manifest(&self, manifest: Manifest) {
        let mut target = self.inner.target.write().unwrap();
        if target.manifest.sha() != manifest.sha() {
            self.inner.completed_count.store(0, Ordering::SeqCst);
            info!(
                old = %target.manifest.sha(),
                new = %manifest.sha(),
                "manifest changed mid-run, completed count reset"
            );
        }
        target.manifest = manifest;
    }

    /// Swap the per-node timeout. `None` disables the deadline.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.target.write().unwrap().timeout = timeout;
    }

    /// Nodes whose updates hit the per-node timeout this run.
    pub fn timed_out_replications(&self) -> Vec<NodeName> {
        self.inner.timed_out.lock().unwrap().clone()
    }
}

/// Closes the enacted and done signals when `enact` returns, in that order
/// (also on early return and panic).
struct EnactedGuard {
    inner: Arc<ReplicationInner>,
}

impl Drop for EnactedGuard {
    fn drop(&mut self) {
        self.inner.enacted.cancel();
        self.inner.done.cancel();
    }
}

/// Releases nodes into the worker queue in rollout order, pacing on the
/// rate limiter when one is configured.
async fn feed_nodes(
    inner: Arc<ReplicationInner>,
    nodes: Vec<NodeName>,
    tx: mpsc::Sender<NodeName>,
) {
    for node in nodes {
        if let Some(interval) = inner.rate_limit {
            tokio::select! {
                _ = inner.cancelled.cancelled() => return,
                _ = inner.quit.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tokio::select! {
            _ = inner.cancelled.cancelled() => return,
            _ = inner.quit.cancelled() => return,
            sent = tx.send(node) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// One worker: pull nodes off the queue until it closes or teardown starts.
async fn worker_loop(
    inner: Arc<ReplicationInner>,
    queue: Arc<TokioMutex<mpsc::Receiver<NodeName>>>,
    aggregate: PodHealth,
) {
    loop {
        let node = {
            let mut rx = queue.lock().await;
            tokio::select! {
                received = rx.recv() => match received {
                    Some(node) => node,
                    None => return,
                },
                _ = inner.quit.cancelled() => return,
            }
        };
        inner.clone().update_node(node, aggregate.clone()).await;
    }
}

/// Bumps the completed count when dropped. Armed once a node passes the
/// short-circuit check, so the count reflects nodes an intent write was
/// issued for, however the update then ends.
struct CompletedGuard<'a>(&'a AtomicU32);

impl Drop for CompletedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ReplicationInner {
    fn manifest(&self) -> Manifest {
        self.target.read().unwrap().manifest.clone()
    }

    /// Run one node's update in its own task, applying the per-node timeout
    /// and converting panics into per-node failures so the pool survives.
    async fn update_node(self: Arc<Self>, node: NodeName, aggregate: PodHealth) {
        let pod = self.manifest().id().clone();
        let timeout = self.target.read().unwrap().timeout;

        let mut task = tokio::spawn({
            let inner = self.clone();
            let node = node.clone();
            async move { inner.update_one(node, aggregate).await }
        });

        let joined = match timeout {
            Some(deadline) => {
                tokio::select! {
                    joined = &mut task => joined,
                    _ = tokio::time::sleep(deadline) => {
                        task.abort();
                        // Wait for the task to unwind so its completion
                        // accounting has landed before the pool moves on.
                        let _ = task.await;
                        Ok(Err(UpdateError::Timeout))
                    }
                }
            }
            None => task.await,
        };

        let result = match joined {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                error!(%node, pod = %pod, "node update panicked");
                let _ = self.err_tx.try_send(ReplicationError::non_fatal(format!(
                    "update for node {node} panicked"
                )));
                return;
            }
            Err(_) => Err(UpdateError::Quit),
        };

        match result {
            Ok(()) => {
                info!(%node, pod = %pod, "node successfully replicated the pod");
            }
            Err(UpdateError::Timeout) => {
                self.timed_out.lock().unwrap().push(node.clone());
                error!(%node, pod = %pod, "node timed out during replication");
            }
            Err(UpdateError::Cancelled) => {
                info!(%node, pod = %pod, "node update cancelled during replication");
            }
            Err(UpdateError::Quit) => {
                debug!(%node, pod = %pod, "node update stopped by teardown");
            }
            Err(err) => {
                error!(%node, pod = %pod, error = %err, "node update failed");
                let _ = self.err_tx.try_send(ReplicationError::non_fatal(format!(
                    "update for node {node} failed: {err}"
                )));
            }
        }
    }

    /// Drive one node to the target: short-circuit if reality already
    /// matches, otherwise write intent, wait for reality, wait for health.
    ///
    /// The target is pinned when the node is picked up; a concurrent
    /// `set_manifest` affects only nodes whose updates start afterwards.
    async fn update_one(
        self: Arc<Self>,
        node: NodeName,
        aggregate: PodHealth,
    ) -> Result<(), UpdateError> {
        let manifest = self.manifest();
        let target_sha = manifest.sha().to_string();

        if !self.should_schedule(&node, &manifest).await? {
            return Ok(());
        }
        let _counted = CompletedGuard(&self.completed_count);

        info!(%node, sha = %target_sha, "updating node");
        let mut txn = Transaction::new();
        self.store
            .set_pod_txn(&mut txn, PodTree::Intent, &node, &manifest)
            .await
            .map_err(UpdateError::Build)?;
        if !self.pod_labels.is_empty() {
            let id = pod_label_key(&node, manifest.id());
            self.labeler
                .set_labels_txn(&mut txn, LabelType::Pod, &id, self.pod_labels.clone())
                .await
                .map_err(UpdateError::Build)?;
        }

        let outcome = tokio::select! {
            committed = self.store.commit_with_retries(&txn) => {
                committed.map_err(UpdateError::Commit)?
            }
            _ = self.quit.cancelled() => return Err(UpdateError::Quit),
            _ = self.cancelled.cancelled() => return Err(UpdateError::Cancelled),
        };
        match outcome {
            CommitOutcome::Committed => {}
            CommitOutcome::Conflict(detail) => {
                error!(%node, %detail, "could not write intent store");
                return Err(UpdateError::Conflict(detail));
            }
        }

        self.ensure_in_reality(&node, manifest.id(), &target_sha)
            .await?;
        self.ensure_healthy(&node, &aggregate).await
    }

    /// Whether this node needs an update at all. Reality matching the
    /// target means no action; a broken reality read must not block the
    /// deploy, so store errors schedule anyway. Teardown and cancellation
    /// propagate so no new intent write starts once the run is stopping.
    async fn should_schedule(
        &self,
        node: &NodeName,
        manifest: &Manifest,
    ) -> Result<bool, UpdateError> {
        match self.query_reality(node, manifest.id()).await {
            Err(UpdateError::Quit) => Err(UpdateError::Quit),
            Err(UpdateError::Cancelled) => Err(UpdateError::Cancelled),
            Err(UpdateError::Store(StoreError::NoCurrentManifest)) => {
                info!(%node, "nothing installed on this node yet");
                Ok(true)
            }
            Err(e) => {
                error!(%node, error = %e, "could not read reality for this node, scheduling anyway");
                Ok(true)
            }
            Ok(reality) => {
                if reality.sha() == manifest.sha() {
                    info!(%node, "reality already matches the target, no action required");
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
        }
    }

    /// Read the node's reality entry, holding one of the shared reality
    /// permits. A worker starved of a slot logs progress after 5 s and
    /// fails the node after 1 min.
    async fn query_reality(
        &self,
        node: &NodeName,
        pod: &PodId,
    ) -> Result<Manifest, UpdateError> {
        let acquire = self.reality_permits.clone().acquire_owned();
        tokio::pin!(acquire);
        let started = Instant::now();

        let _permit = loop {
            tokio::select! {
                permit = &mut acquire => {
                    // The semaphore lives as long as the run; acquisition
                    // cannot observe it closed.
                    break permit.map_err(|_| UpdateError::Quit)?;
                }
                _ = tokio::time::sleep(REALITY_SLOT_PROGRESS) => {
                    if started.elapsed() >= REALITY_SLOT_DEADLINE {
                        error!(%node, pod = %pod, "timed out waiting for a reality query slot");
                        return Err(UpdateError::RealityStarved);
                    }
                    info!(%node, pod = %pod, "waiting for a reality query slot");
                }
                _ = self.quit.cancelled() => return Err(UpdateError::Quit),
                _ = self.cancelled.cancelled() => return Err(UpdateError::Cancelled),
            }
        };

        let (manifest, _ttl) = self.store.pod(PodTree::Reality, node, pod).await?;
        Ok(manifest)
    }

    /// Poll reality until the node reports the target SHA.
    async fn ensure_in_reality(
        &self,
        node: &NodeName,
        pod: &PodId,
        target_sha: &str,
    ) -> Result<(), UpdateError> {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => {
                    info!(%node, "caught quit signal while waiting for reality");
                    return Err(UpdateError::Quit);
                }
                _ = self.cancelled.cancelled() => {
                    info!(%node, "caught cancellation signal while waiting for reality");
                    return Err(UpdateError::Cancelled);
                }
                _ = tokio::time::sleep(self.reality_poll_period) => {
                    match self.query_reality(node, pod).await {
                        // The pod key not existing yet just means the node
                        // hasn't picked anything up; keep waiting.
                        Err(UpdateError::Store(StoreError::NoCurrentManifest)) => {}
                        Err(UpdateError::Quit) => return Err(UpdateError::Quit),
                        Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                        Err(e) => {
                            error!(%node, error = %e, "could not read reality for pod manifest");
                        }
                        Ok(reality) => {
                            if reality.sha() == target_sha {
                                info!(%node, "node is current");
                                return Ok(());
                            }
                            info!(
                                %node,
                                current = %reality.sha(),
                                target = %target_sha,
                                "waiting for node to become current"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Poll the aggregator until the node's health meets the threshold.
    /// Nodes missing from the snapshot count as critical.
    async fn ensure_healthy(
        &self,
        node: &NodeName,
        aggregate: &PodHealth,
    ) -> Result<(), UpdateError> {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => {
                    info!(%node, "caught quit signal while waiting for health");
                    return Err(UpdateError::Quit);
                }
                _ = self.cancelled.cancelled() => {
                    info!(%node, "caught cancellation signal while waiting for health");
                    return Err(UpdateError::Cancelled);
                }
                _ = tokio::time::sleep(self.health_poll_period) => {
                    let (check_id, status) = match aggregate.get_health(node) {
                        Some(result) => (result.check_id, result.status),
                        None => {
                            warn!(%node, "no health entry for node yet, treating as critical");
                            (String::new(), HealthState::Critical)
                        }
                    };
                    if status.meets(self.threshold) {
                        info!(%node, "node is current and healthy");
                        return Ok(());
                    }
                    info!(%node, check = %check_id, health = %status, "node is not healthy yet");
                }
            }
        }
    }
}
