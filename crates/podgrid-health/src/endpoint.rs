//! Status-endpoint derivation.
//!
//! A node's status endpoint is derived from the manifest's status stanza:
//! `<scheme>://<node>:<port><path>`, where the scheme is `http` only when
//! the stanza says so and the path defaults to `/_status`. The inverse
//! mapping (endpoint → node) lets watchers attribute probe results back to
//! nodes.

use podgrid_manifest::{NodeName, StatusStanza};
use url::Url;

use crate::error::HealthError;

/// Default path of a pod's status endpoint.
pub const DEFAULT_STATUS_PATH: &str = "/_status";

/// Derive the status endpoint URL for a pod on `node`.
pub fn node_status_endpoint(node: &NodeName, stanza: &StatusStanza) -> String {
    let scheme = if stanza.http { "http" } else { "https" };
    let path = if stanza.path.is_empty() {
        DEFAULT_STATUS_PATH
    } else {
        stanza.path.as_str()
    };
    if path.starts_with('/') {
        format!("{scheme}://{node}:{}{path}", stanza.port)
    } else {
        format!("{scheme}://{node}:{}/{path}", stanza.port)
    }
}

/// Recover the node name from a status endpoint URL.
pub fn endpoint_node(endpoint: &str) -> Result<NodeName, HealthError> {
    let url = Url::parse(endpoint)?;
    let host = url
        .host_str()
        .ok_or_else(|| HealthError::NoHost(endpoint.to_string()))?;
    Ok(NodeName::from(host))
}
