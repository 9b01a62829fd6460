//! Error types for health checking.

use thiserror::Error;

/// Errors that can occur while resolving, deriving, or probing health.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("invalid status endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("status endpoint {0} has no host")]
    NoHost(String),

    #[error("could not resolve nodes for service {service}: {detail}")]
    Resolve { service: String, detail: String },

    #[error("health probe failed: {0}")]
    Probe(String),
}
