//! Health probe interface.
//!
//! The engine never probes status endpoints itself: a deployment wires in a
//! probe client, or replaces direct probing entirely with a central health
//! service. Everything downstream (the checker, the aggregator, the
//! replication engine) consumes probing through this trait.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::HealthError;
use crate::state::HealthState;

/// Issues health probes against status endpoints.
#[async_trait]
pub trait HealthClient: Send + Sync {
    /// Probe a single endpoint. An endpoint that yields no response reports
    /// `Unknown`; an `Err` means the endpoint itself was malformed.
    async fn check_endpoint(&self, endpoint: &str) -> Result<HealthState, HealthError>;

    /// Probe many endpoints as one batch.
    ///
    /// Implementations are free to fan probes out; the default probes
    /// sequentially. Endpoints that fail to probe map to `Unknown`.
    async fn check_endpoints(&self, endpoints: &[String]) -> HashMap<String, HealthState> {
        let mut results = HashMap::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let status = self
                .check_endpoint(endpoint)
                .await
                .unwrap_or(HealthState::Unknown);
            results.insert(endpoint.clone(), status);
        }
        results
    }
}
