//! Health states and per-check results.

use std::fmt;
use std::str::FromStr;

use podgrid_manifest::NodeName;
use serde::{Deserialize, Serialize};

/// Health of a single pod on a single node.
///
/// States are totally ordered from least to most healthy, so threshold
/// checks are plain comparisons: a node is acceptable when
/// `status >= threshold`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No signal: the endpoint did not respond or was never probed.
    #[default]
    Unknown,
    Critical,
    Warning,
    Passing,
}

impl HealthState {
    /// Whether this state satisfies the given minimum.
    pub fn meets(&self, threshold: HealthState) -> bool {
        *self >= threshold
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Critical => "critical",
            HealthState::Warning => "warning",
            HealthState::Passing => "passing",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthState::Unknown),
            "critical" => Ok(HealthState::Critical),
            "warning" => Ok(HealthState::Warning),
            "passing" => Ok(HealthState::Passing),
            other => Err(format!("unknown health state {other:?}")),
        }
    }
}

/// Outcome of one health check for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResult {
    pub node: NodeName,
    /// The service (pod id) this check belongs to.
    pub service: String,
    /// Identity of the check that produced this result. For probe-based
    /// checks this is the status endpoint URL.
    pub check_id: String,
    pub status: HealthState,
}
