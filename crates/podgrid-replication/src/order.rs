//! Health-weighted rollout ordering.
//!
//! Deploying the least healthy nodes first maximizes overall service health
//! during a rollout: a node that is already down loses nothing by being
//! restarted, while healthy nodes keep serving until the end. The expected
//! order is `[critical, alpha][no-status/unknown, alpha][warning, alpha]
//! [passing, alpha]`.

use podgrid_health::{HealthState, ServiceSnapshot};
use podgrid_manifest::NodeName;

/// Bucket rank for rollout ordering; lower deploys earlier. A node with no
/// health entry ranks with `Unknown`: ahead of anything healthy, behind
/// known-critical nodes.
fn health_bucket(status: Option<HealthState>) -> u8 {
    match status {
        Some(HealthState::Critical) => 0,
        None | Some(HealthState::Unknown) => 1,
        Some(HealthState::Warning) => 2,
        Some(HealthState::Passing) => 3,
    }
}

/// Sort nodes least-healthy first against a reference health snapshot, ties
/// broken by node name. The result is deterministic for a given snapshot
/// regardless of the input order.
pub fn sort_for_rollout(nodes: &mut [NodeName], health: &ServiceSnapshot) {
    nodes.sort_by(|a, b| {
        let a_bucket = health_bucket(health.get(a).map(|r| r.status));
        let b_bucket = health_bucket(health.get(b).map(|r| r.status));
        a_bucket.cmp(&b_bucket).then_with(|| a.cmp(b))
    });
}
