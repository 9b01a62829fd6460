//! Construction of replication runs.
//!
//! `Replicator` holds everything that is the same across runs of one pod
//! (stores, health checker, target nodes) and mints `Replication`s:
//! acquiring the per-pod replication lock on a fresh session, verifying no
//! target pod is owned by a controller, and spawning the end-handler that
//! owns session teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use podgrid_health::{HealthChecker, HealthState};
use podgrid_manifest::{pod_label_key, Manifest, NodeName};
use podgrid_store::{
    replication_lock_path, LabelSet, LabelType, Labeler, Session, Store, StoreError,
    CONTROLLER_ID_LABEL,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::ReplicationError;
use crate::replication::{
    Replication, ReplicationParams, DEFAULT_HEALTH_POLL_PERIOD, DEFAULT_REALITY_POLL_PERIOD,
};

/// Per-run tunables for [`Replicator::initialize_replication`].
pub struct ReplicationOptions {
    /// If the replication lock is already held, destroy the holder's
    /// session and retry once.
    pub override_lock: bool,
    /// Skip the managed-pod preflight check.
    pub ignore_controllers: bool,
    /// Capacity of the shared reality-query semaphore.
    pub concurrent_reality_requests: usize,
    /// Minimum spacing between node releases into the worker pool.
    pub rate_limit: Option<Duration>,
    /// Per-node deadline. `None` disables it.
    pub timeout: Option<Duration>,
    /// Labels applied to every pod this run schedules, in the same
    /// transaction as the intent write.
    pub pod_labels: LabelSet,
    /// Cadence of the live health watch (floored at one second by the
    /// checker).
    pub health_watch_delay: Duration,
    /// Externally supplied node queue. When set, the run deploys whatever
    /// nodes arrive on it and only ends when the caller closes it.
    pub node_queue: Option<mpsc::Receiver<NodeName>>,
    /// Period between reality polls per node.
    pub ensure_in_reality_period: Duration,
    /// Period between health polls per node.
    pub ensure_healthy_period: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            override_lock: false,
            ignore_controllers: false,
            concurrent_reality_requests: 10,
            rate_limit: None,
            timeout: None,
            pod_labels: LabelSet::new(),
            health_watch_delay: Duration::from_secs(1),
            node_queue: None,
            ensure_in_reality_period: DEFAULT_REALITY_POLL_PERIOD,
            ensure_healthy_period: DEFAULT_HEALTH_POLL_PERIOD,
        }
    }
}

/// Mints replication runs for one pod across a fixed node set.
pub struct Replicator {
    store: Arc<dyn Store>,
    labeler: Arc<dyn Labeler>,
    health: Arc<dyn HealthChecker>,
    manifest: Manifest,
    nodes: Vec<NodeName>,
    active: usize,
    threshold: HealthState,
    lock_message: String,
}

impl Replicator {
    pub fn new(
        store: Arc<dyn Store>,
        labeler: Arc<dyn Labeler>,
        health: Arc<dyn HealthChecker>,
        manifest: Manifest,
        nodes: Vec<NodeName>,
    ) -> Self {
        let lock_message = format!("replication of {}", manifest.id());
        Self {
            store,
            labeler,
            health,
            manifest,
            nodes,
            active: 1,
            threshold: HealthState::Passing,
            lock_message,
        }
    }

    /// Maximum concurrent per-node updaters.
    pub fn with_active(mut self, active: usize) -> Self {
        self.active = active.max(1);
        self
    }

    /// Minimum health state to treat a node as done. Defaults to passing.
    pub fn with_threshold(mut self, threshold: Option<HealthState>) -> Self {
        self.threshold = threshold.unwrap_or(HealthState::Passing);
        self
    }

    /// Human-readable session name shown to whoever inspects the lock.
    pub fn with_lock_message(mut self, message: impl Into<String>) -> Self {
        self.lock_message = message.into();
        self
    }

    /// Acquire the replication lock and build a run.
    ///
    /// On success the run is ready to `enact()`, the end-handler owns the
    /// lock session, and the returned receiver carries the run's errors
    /// (fatal and per-node). On failure the session is destroyed before
    /// returning.
    pub async fn initialize_replication(
        &self,
        options: ReplicationOptions,
    ) -> Result<(Replication, mpsc::Receiver<ReplicationError>), ReplicationError> {
        let (session, renewal_rx) = self
            .store
            .new_session(&self.lock_message)
            .await
            .map_err(ReplicationError::fatal)?;

        let lock_path = replication_lock_path(self.manifest.id());
        if let Err(e) = self
            .acquire_lock(session.as_ref(), &lock_path, options.override_lock)
            .await
        {
            let _ = session.destroy().await;
            return Err(e);
        }

        if !options.ignore_controllers {
            if let Err(e) = self.check_for_managed().await {
                let _ = session.destroy().await;
                return Err(e);
            }
        }

        let (err_tx, err_rx) = mpsc::channel(16);
        let replication = Replication::new(ReplicationParams {
            active: self.active,
            nodes: self.nodes.clone(),
            store: self.store.clone(),
            labeler: self.labeler.clone(),
            health: self.health.clone(),
            manifest: self.manifest.clone(),
            threshold: self.threshold,
            pod_labels: options.pod_labels,
            rate_limit: options.rate_limit,
            err_tx: err_tx.clone(),
            concurrent_reality_requests: options.concurrent_reality_requests,
            timeout: options.timeout,
            health_watch_delay: options.health_watch_delay,
            reality_poll_period: options.ensure_in_reality_period,
            health_poll_period: options.ensure_healthy_period,
            node_queue: options.node_queue,
        });

        tokio::spawn(run_end_handler(
            replication.inner(),
            session,
            renewal_rx,
            err_tx,
        ));

        info!(pod = %self.manifest.id(), "replication initialized");
        Ok((replication, err_rx))
    }

    /// Acquisition policy: on already-locked, read the holder; no holder
    /// means a lock delay is in effect (no retry); with `override_lock` the
    /// holder's session is destroyed and acquisition retried exactly once.
    async fn acquire_lock(
        &self,
        session: &dyn Session,
        lock_path: &str,
        override_lock: bool,
    ) -> Result<(), ReplicationError> {
        match session.lock(lock_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_locked() => {
                let (holder, holder_id) =
                    self.store.lock_holder(lock_path).await.map_err(|e| {
                        ReplicationError::fatal(format!(
                            "lock already held for {lock_path:?}, could not determine holder: {e}"
                        ))
                    })?;
                if holder.is_empty() {
                    Err(ReplicationError::fatal(format!(
                        "lock for {lock_path:?} is blocked due to delay by previous holder"
                    )))
                } else if override_lock {
                    self.store
                        .destroy_lock_holder(&holder_id)
                        .await
                        .map_err(|e| {
                            ReplicationError::fatal(format!(
                                "unable to destroy the current lock holder ({holder}) for {lock_path:?}: {e}"
                            ))
                        })?;
                    // Retry without destroying holders again, so a livelock
                    // against another overriding party cannot loop forever.
                    Box::pin(self.acquire_lock(session, lock_path, false)).await
                } else {
                    Err(ReplicationError::fatal(format!(
                        "lock for {lock_path:?} already held by {holder:?}"
                    )))
                }
            }
            Err(err) => Err(ReplicationError::fatal(err)),
        }
    }

    /// Refuse to replicate over pods that a controller owns: such changes
    /// must go through that controller.
    async fn check_for_managed(&self) -> Result<(), ReplicationError> {
        let mut managed = Vec::new();
        for node in &self.nodes {
            let key = pod_label_key(node, self.manifest.id());
            let labels = self
                .labeler
                .get_labels(LabelType::Pod, &key)
                .await
                .map_err(ReplicationError::fatal)?;
            if labels.contains_key(CONTROLLER_ID_LABEL) {
                managed.push(node.to_string());
            }
        }
        if !managed.is_empty() {
            return Err(ReplicationError::fatal(format!(
                "cannot replicate to nodes already managed by a controller: {}",
                managed.join(", ")
            )));
        }
        Ok(())
    }
}

/// Owns the end of a run: waits for completion, cancellation, or lock loss;
/// tears the run down; destroys the lock session last.
///
/// On cancellation (and on lock loss after an enactment started) it waits
/// for the enacted signal, so every worker is gone before the session and
/// the lock it holds are released.
async fn run_end_handler(
    inner: Arc<crate::replication::ReplicationInner>,
    session: Box<dyn Session>,
    mut renewal_rx: mpsc::Receiver<StoreError>,
    err_tx: mpsc::Sender<ReplicationError>,
) {
    let mut renewal_open = true;
    loop {
        tokio::select! {
            _ = inner.done.cancelled() => {
                info!("replication completed successfully");
                break;
            }
            _ = inner.cancelled.cancelled() => {
                info!("replication was cancelled");
                if inner.enact_started.load(Ordering::SeqCst) {
                    inner.enacted.cancelled().await;
                }
                break;
            }
            renewal = renewal_rx.recv(), if renewal_open => match renewal {
                Some(renewal_err) => {
                    info!("replication session was lost");
                    inner.quit.cancel();
                    let _ = err_tx
                        .send(ReplicationError::fatal(renewal_err))
                        .await;
                    if inner.enact_started.load(Ordering::SeqCst) {
                        inner.enacted.cancelled().await;
                    }
                    break;
                }
                // The renewal channel closing without an error just means
                // the backend stopped reporting; keep waiting on the rest.
                None => renewal_open = false,
            }
        }
    }

    inner.quit.cancel();
    if let Err(e) = session.destroy().await {
        warn!(error = %e, "failed to destroy replication session");
    }
}
