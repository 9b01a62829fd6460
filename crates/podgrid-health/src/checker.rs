//! Per-service health views.
//!
//! `Service` is a one-shot snapshot of every node of a service;
//! `WatchService` re-probes on a cadence and emits the full node→result map
//! each round. Snapshots are always whole: a node with no response appears
//! as `Unknown`, and a node that left the service is absent from the next
//! emission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use podgrid_manifest::{NodeName, StatusStanza};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::HealthClient;
use crate::endpoint::node_status_endpoint;
use crate::error::HealthError;
use crate::state::{HealthResult, HealthState};

/// The full health picture of one service: node → latest result.
pub type ServiceSnapshot = HashMap<NodeName, HealthResult>;

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Resolves a service id to its current member nodes and status stanza.
///
/// Injected so membership can come from the coordination backend, a service
/// registry, or a fixture in tests.
pub type ServiceResolver = Arc<
    dyn Fn(String) -> BoxFuture<Result<(Vec<NodeName>, StatusStanza), HealthError>>
        + Send
        + Sync,
>;

/// Lower bound on the watch cadence, to cap probe load on large services.
pub const MIN_WATCH_DELAY: Duration = Duration::from_secs(1);

fn effective_watch_delay(watch_delay: Duration) -> Duration {
    watch_delay.max(MIN_WATCH_DELAY)
}

/// Per-service health checking.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// One-shot snapshot of every node of the service.
    async fn service(&self, service_id: &str) -> Result<ServiceSnapshot, HealthError>;

    /// Probe the service on a cadence of at least `watch_delay` (floored at
    /// [`MIN_WATCH_DELAY`]), emitting a whole snapshot per round on
    /// `result_tx` until the token is cancelled or the receiver is dropped.
    /// Probe-round errors go to `err_tx`; the watch keeps running.
    async fn watch_service(
        &self,
        token: CancellationToken,
        service_id: &str,
        result_tx: mpsc::Sender<ServiceSnapshot>,
        err_tx: mpsc::Sender<HealthError>,
        watch_delay: Duration,
    );
}

/// `HealthChecker` built from a probe client and a membership resolver.
pub struct ProbingHealthChecker {
    client: Arc<dyn HealthClient>,
    resolver: ServiceResolver,
}

impl ProbingHealthChecker {
    pub fn new(client: Arc<dyn HealthClient>, resolver: ServiceResolver) -> Self {
        Self { client, resolver }
    }

    async fn snapshot(&self, service_id: &str) -> Result<ServiceSnapshot, HealthError> {
        let (nodes, stanza) = (self.resolver)(service_id.to_string()).await?;

        if stanza.port == 0 {
            // No status endpoint to probe: the pod is defined to pass.
            return Ok(nodes
                .into_iter()
                .map(|node| {
                    let result = HealthResult {
                        node: node.clone(),
                        service: service_id.to_string(),
                        check_id: String::new(),
                        status: HealthState::Passing,
                    };
                    (node, result)
                })
                .collect());
        }

        let endpoints: Vec<(NodeName, String)> = nodes
            .iter()
            .map(|node| (node.clone(), node_status_endpoint(node, &stanza)))
            .collect();
        let urls: Vec<String> = endpoints.iter().map(|(_, url)| url.clone()).collect();
        let statuses = self.client.check_endpoints(&urls).await;

        Ok(endpoints
            .into_iter()
            .map(|(node, endpoint)| {
                let status = statuses.get(&endpoint).copied().unwrap_or_default();
                let result = HealthResult {
                    node: node.clone(),
                    service: service_id.to_string(),
                    check_id: endpoint,
                    status,
                };
                (node, result)
            })
            .collect())
    }
}

#[async_trait]
impl HealthChecker for ProbingHealthChecker {
    async fn service(&self, service_id: &str) -> Result<ServiceSnapshot, HealthError> {
        self.snapshot(service_id).await
    }

    async fn watch_service(
        &self,
        token: CancellationToken,
        service_id: &str,
        result_tx: mpsc::Sender<ServiceSnapshot>,
        err_tx: mpsc::Sender<HealthError>,
        watch_delay: Duration,
    ) {
        let delay = effective_watch_delay(watch_delay);
        debug!(service = %service_id, ?delay, "service health watch starting");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                snapshot = self.snapshot(service_id) => match snapshot {
                    Ok(snap) => {
                        if result_tx.send(snap).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(service = %service_id, error = %e, "health watch round failed");
                        let _ = err_tx.try_send(e);
                    }
                },
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(service = %service_id, "service health watch stopped");
    }
}
