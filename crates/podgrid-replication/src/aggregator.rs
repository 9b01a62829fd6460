//! Per-pod health aggregation.
//!
//! Replication workers poll health at different cadences; giving each its
//! own watch would multiply load on the health backend. A [`PodHealth`]
//! holds exactly one `watch_service` subscription per pod and caches the
//! latest whole snapshot for any number of workers to query.

use std::sync::Arc;
use std::time::Duration;

use podgrid_health::{HealthChecker, HealthResult, HealthState, ServiceSnapshot};
use podgrid_manifest::{NodeName, PodId};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The latest service-wide health snapshot for one pod.
///
/// Cloning shares the underlying subscription. Each incoming snapshot
/// replaces the cached map atomically, so readers always observe some whole
/// snapshot published no later than their read, never a partial update.
#[derive(Clone)]
pub struct PodHealth {
    snapshot: watch::Receiver<Option<Arc<ServiceSnapshot>>>,
    stop: CancellationToken,
}

impl PodHealth {
    /// Subscribe to a pod's service health and wait for the first snapshot.
    ///
    /// Returns once the watcher has emitted at least once. If the watcher
    /// exits without ever emitting, an empty snapshot is installed instead
    /// so the caller still unblocks.
    pub async fn start(
        pod: PodId,
        checker: Arc<dyn HealthChecker>,
        watch_delay: Duration,
    ) -> Self {
        let (snap_tx, snap_rx) = watch::channel(None);
        let stop = CancellationToken::new();

        let (result_tx, mut result_rx) = mpsc::channel::<ServiceSnapshot>(1);
        let (err_tx, mut err_rx) = mpsc::channel(4);

        // Watch errors are transient by design; the watch keeps running.
        // Drain them so the watcher never blocks reporting one.
        tokio::spawn(async move { while err_rx.recv().await.is_some() {} });

        let watch_token = stop.child_token();
        tokio::spawn({
            let pod = pod.clone();
            async move {
                checker
                    .watch_service(watch_token, pod.as_str(), result_tx, err_tx, watch_delay)
                    .await;
            }
        });

        tokio::spawn({
            let stop = stop.clone();
            let pod = pod.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        received = result_rx.recv() => match received {
                            Some(snapshot) => {
                                let _ = snap_tx.send(Some(Arc::new(snapshot)));
                            }
                            None => break,
                        },
                    }
                }
                // Always unblock start(), even when the watcher never
                // produced anything.
                snap_tx.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(Arc::new(ServiceSnapshot::new()));
                        true
                    } else {
                        false
                    }
                });
                debug!(pod = %pod, "pod health subscription ended");
            }
        });

        let mut first = snap_rx.clone();
        let _ = first.wait_for(|snapshot| snapshot.is_some()).await;

        Self {
            snapshot: snap_rx,
            stop,
        }
    }

    /// The latest result for one node, if the snapshot has one.
    pub fn get_health(&self, node: &NodeName) -> Option<HealthResult> {
        self.snapshot
            .borrow()
            .as_ref()
            .and_then(|map| map.get(node).cloned())
    }

    fn count_with_status(&self, nodes: &[NodeName], status: HealthState) -> usize {
        self.snapshot.borrow().as_ref().map_or(0, |map| {
            nodes
                .iter()
                .filter(|node| map.get(node).is_some_and(|r| r.status == status))
                .count()
        })
    }

    /// How many of `nodes` are currently passing.
    pub fn num_healthy_of(&self, nodes: &[NodeName]) -> usize {
        self.count_with_status(nodes, HealthState::Passing)
    }

    /// How many of `nodes` are currently critical.
    pub fn num_unhealthy_of(&self, nodes: &[NodeName]) -> usize {
        self.count_with_status(nodes, HealthState::Critical)
    }

    /// How many of `nodes` currently have unknown health.
    pub fn num_unknown_health_of(&self, nodes: &[NodeName]) -> usize {
        self.count_with_status(nodes, HealthState::Unknown)
    }

    /// How many of `nodes` are currently at warning.
    pub fn num_warning_health_of(&self, nodes: &[NodeName]) -> usize {
        self.count_with_status(nodes, HealthState::Warning)
    }

    /// Stop the subscription. Reads keep returning the last snapshot.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use podgrid_health::HealthError;
    use std::sync::Mutex;

    /// A checker that emits a scripted sequence of snapshots and then either
    /// holds until cancelled or exits.
    struct ScriptedChecker {
        snapshots: Mutex<Vec<ServiceSnapshot>>,
        hold_after: bool,
    }

    impl ScriptedChecker {
        fn emitting(snapshots: Vec<ServiceSnapshot>) -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(snapshots),
                hold_after: true,
            })
        }

        fn exiting_immediately() -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(Vec::new()),
                hold_after: false,
            })
        }
    }

    #[async_trait]
    impl HealthChecker for ScriptedChecker {
        async fn service(&self, _service_id: &str) -> Result<ServiceSnapshot, HealthError> {
            Ok(ServiceSnapshot::new())
        }

        async fn watch_service(
            &self,
            token: CancellationToken,
            _service_id: &str,
            result_tx: mpsc::Sender<ServiceSnapshot>,
            _err_tx: mpsc::Sender<HealthError>,
            _watch_delay: Duration,
        ) {
            let snapshots = std::mem::take(&mut *self.snapshots.lock().unwrap());
            for snapshot in snapshots {
                if result_tx.send(snapshot).await.is_err() {
                    return;
                }
            }
            if self.hold_after {
                token.cancelled().await;
            }
        }
    }

    fn result(node: &str, status: HealthState) -> (NodeName, HealthResult) {
        let node = NodeName::from(node);
        (
            node.clone(),
            HealthResult {
                node,
                service: "web".to_string(),
                check_id: String::new(),
                status,
            },
        )
    }

    fn snapshot(entries: &[(&str, HealthState)]) -> ServiceSnapshot {
        entries.iter().map(|(n, s)| result(n, *s)).collect()
    }

    #[tokio::test]
    async fn start_unblocks_on_first_snapshot() {
        let checker = ScriptedChecker::emitting(vec![snapshot(&[
            ("host1", HealthState::Passing),
            ("host2", HealthState::Critical),
        ])]);
        let health = PodHealth::start("web".into(), checker, Duration::from_secs(1)).await;

        let host1 = health.get_health(&NodeName::from("host1")).unwrap();
        assert_eq!(host1.status, HealthState::Passing);
        assert!(health.get_health(&NodeName::from("absent")).is_none());
        health.stop();
    }

    #[tokio::test]
    async fn watcher_that_never_emits_still_unblocks_with_empty_map() {
        let checker = ScriptedChecker::exiting_immediately();
        let health = PodHealth::start("web".into(), checker, Duration::from_secs(1)).await;

        assert!(health.get_health(&NodeName::from("host1")).is_none());
        assert_eq!(health.num_healthy_of(&[NodeName::from("host1")]), 0);
        health.stop();
    }

    #[tokio::test]
    async fn counts_by_status() {
        let checker = ScriptedChecker::emitting(vec![snapshot(&[
            ("a", HealthState::Passing),
            ("b", HealthState::Passing),
            ("c", HealthState::Critical),
            ("d", HealthState::Warning),
            ("e", HealthState::Unknown),
        ])]);
        let health = PodHealth::start("web".into(), checker, Duration::from_secs(1)).await;

        let nodes: Vec<NodeName> = ["a", "b", "c", "d", "e", "f"]
            .into_iter()
            .map(NodeName::from)
            .collect();
        assert_eq!(health.num_healthy_of(&nodes), 2);
        assert_eq!(health.num_unhealthy_of(&nodes), 1);
        assert_eq!(health.num_warning_health_of(&nodes), 1);
        // "f" has no entry at all, so it is not counted as unknown either.
        assert_eq!(health.num_unknown_health_of(&nodes), 1);
        health.stop();
    }

    #[tokio::test]
    async fn later_snapshots_replace_the_whole_map() {
        let checker = ScriptedChecker::emitting(vec![
            snapshot(&[("a", HealthState::Critical), ("b", HealthState::Passing)]),
            snapshot(&[("a", HealthState::Passing)]),
        ]);
        let health = PodHealth::start("web".into(), checker, Duration::from_secs(1)).await;

        // Wait until the second snapshot lands ("a" flips to passing and
        // "b" disappears entirely).
        let a = NodeName::from("a");
        let b = NodeName::from("b");
        loop {
            if health.get_health(&a).map(|r| r.status) == Some(HealthState::Passing) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(health.get_health(&b).is_none());
        health.stop();
    }

    #[tokio::test]
    async fn reads_after_stop_return_last_snapshot() {
        let checker =
            ScriptedChecker::emitting(vec![snapshot(&[("host1", HealthState::Warning)])]);
        let health = PodHealth::start("web".into(), checker, Duration::from_secs(1)).await;
        health.stop();

        let result = health.get_health(&NodeName::from("host1")).unwrap();
        assert_eq!(result.status, HealthState::Warning);
    }
}
