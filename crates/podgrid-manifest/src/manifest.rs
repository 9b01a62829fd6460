//! The `Manifest` value and its status stanza.
//!
//! Manifests are immutable once built. The content SHA is computed over the
//! raw YAML bytes at construction, so `sha()` is infallible and cheap, and
//! cloning a manifest is an `Arc` bump.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ManifestError;
use crate::types::PodId;

/// Description of a pod's health status endpoint.
///
/// A `port` of 0 means the pod exposes no status endpoint; health checks
/// report it as passing unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusStanza {
    /// Probe over plain HTTP instead of HTTPS.
    #[serde(default)]
    pub http: bool,
    /// Path of the status endpoint. Empty means `/_status`.
    #[serde(default)]
    pub path: String,
    /// Port of the status endpoint. 0 disables health checking.
    #[serde(default)]
    pub port: u16,
}

/// The parsed YAML document of a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestDoc {
    id: PodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_as_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<StatusStanza>,
    /// Launchables, config, and any other stanzas the engine does not
    /// interpret. Preserved so a rebuilt manifest round-trips.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

struct ManifestInner {
    raw: Vec<u8>,
    doc: ManifestDoc,
    sha: String,
    signature: Option<Vec<u8>>,
}

/// Immutable declarative description of a pod, identified by content hash.
#[derive(Clone)]
pub struct Manifest {
    inner: Arc<ManifestInner>,
}

impl Manifest {
    /// Parse a manifest from its raw YAML bytes.
    pub fn from_yaml_bytes(raw: impl Into<Vec<u8>>) -> Result<Self, ManifestError> {
        let raw = raw.into();
        let doc: ManifestDoc = serde_yaml::from_slice(&raw)?;
        if doc.id.as_str().is_empty() {
            return Err(ManifestError::EmptyId);
        }
        let sha = content_sha(&raw);
        Ok(Self {
            inner: Arc::new(ManifestInner {
                raw,
                doc,
                sha,
                signature: None,
            }),
        })
    }

    /// Start building a manifest in memory.
    pub fn builder(id: impl Into<PodId>) -> ManifestBuilder {
        ManifestBuilder {
            doc: ManifestDoc {
                id: id.into(),
                run_as_user: None,
                status: None,
                extra: BTreeMap::new(),
            },
        }
    }

    /// The pod this manifest describes.
    pub fn id(&self) -> &PodId {
        &self.inner.doc.id
    }

    /// The user the pod runs as. Defaults to the pod id.
    pub fn run_as_user(&self) -> &str {
        self.inner
            .doc
            .run_as_user
            .as_deref()
            .unwrap_or_else(|| self.inner.doc.id.as_str())
    }

    /// The status stanza, defaulted when the manifest has none.
    pub fn status(&self) -> StatusStanza {
        self.inner.doc.status.clone().unwrap_or_default()
    }

    /// Hex SHA-256 of the raw manifest bytes.
    pub fn sha(&self) -> &str {
        &self.inner.sha
    }

    /// The raw YAML bytes this manifest was built from.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.inner.raw
    }

    /// Detached signature over the raw bytes, if one was attached.
    pub fn signature(&self) -> Option<&[u8]> {
        self.inner.signature.as_deref()
    }

    /// Attach a detached signature. The signature is carried alongside the
    /// manifest; it does not participate in the content hash.
    pub fn with_signature(&self, signature: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(ManifestInner {
                raw: self.inner.raw.clone(),
                doc: self.inner.doc.clone(),
                sha: self.inner.sha.clone(),
                signature: Some(signature.into()),
            }),
        }
    }
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.inner.sha == other.inner.sha
    }
}

impl Eq for Manifest {}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("id", &self.inner.doc.id)
            .field("sha", &self.inner.sha)
            .finish()
    }
}

/// Builds a manifest in memory and serializes it to canonical YAML, so the
/// content hash of a built manifest is stable across runs.
pub struct ManifestBuilder {
    doc: ManifestDoc,
}

impl ManifestBuilder {
    pub fn run_as_user(mut self, user: impl Into<String>) -> Self {
        self.doc.run_as_user = Some(user.into());
        self
    }

    pub fn status(mut self, status: StatusStanza) -> Self {
        self.doc.status = Some(status);
        self
    }

    /// Add an uninterpreted stanza (launchables, config, ...).
    pub fn stanza(mut self, key: impl Into<String>, value: serde_yaml::Value) -> Self {
        self.doc.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<Manifest, ManifestError> {
        if self.doc.id.as_str().is_empty() {
            return Err(ManifestError::EmptyId);
        }
        let raw = serde_yaml::to_string(&self.doc)?.into_bytes();
        let sha = content_sha(&raw);
        Ok(Manifest {
            inner: Arc::new(ManifestInner {
                raw,
                doc: self.doc,
                sha,
                signature: None,
            }),
        })
    }
}

fn content_sha(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
id: web
run_as_user: deployer
status:
  http: true
  port: 8000
launchables:
  app:
    type: hoist
    location: https://artifacts.example/web_abc123.tar.gz
";

    #[test]
    fn parses_yaml_manifest() {
        let m = Manifest::from_yaml_bytes(SAMPLE).unwrap();
        assert_eq!(m.id().as_str(), "web");
        assert_eq!(m.run_as_user(), "deployer");
        let status = m.status();
        assert!(status.http);
        assert_eq!(status.port, 8000);
        assert_eq!(status.path, "");
    }

    #[test]
    fn run_as_user_defaults_to_pod_id() {
        let m = Manifest::builder("web").build().unwrap();
        assert_eq!(m.run_as_user(), "web");
    }

    #[test]
    fn sha_is_stable_over_raw_bytes() {
        let a = Manifest::from_yaml_bytes(SAMPLE).unwrap();
        let b = Manifest::from_yaml_bytes(SAMPLE).unwrap();
        assert_eq!(a.sha(), b.sha());
        assert_eq!(a, b);
    }

    #[test]
    fn reparse_preserves_sha() {
        let m = Manifest::builder("web")
            .status(StatusStanza {
                http: false,
                path: "/_status".to_string(),
                port: 443,
            })
            .build()
            .unwrap();
        let reparsed = Manifest::from_yaml_bytes(m.raw_bytes().to_vec()).unwrap();
        assert_eq!(reparsed.sha(), m.sha());
    }

    #[test]
    fn different_content_different_sha() {
        let a = Manifest::builder("web").build().unwrap();
        let b = Manifest::builder("web").run_as_user("other").build().unwrap();
        assert_ne!(a.sha(), b.sha());
    }

    #[test]
    fn empty_id_rejected() {
        assert!(matches!(
            Manifest::from_yaml_bytes("id: \"\"\n"),
            Err(ManifestError::EmptyId)
        ));
    }

    #[test]
    fn signature_is_detached_from_sha() {
        let m = Manifest::builder("web").build().unwrap();
        let signed = m.with_signature(b"sig".to_vec());
        assert_eq!(signed.sha(), m.sha());
        assert_eq!(signed.signature(), Some(&b"sig"[..]));
        assert_eq!(m.signature(), None);
    }

    #[test]
    fn missing_status_stanza_defaults_to_port_zero() {
        let m = Manifest::from_yaml_bytes("id: web\n").unwrap();
        assert_eq!(m.status().port, 0);
        assert!(!m.status().http);
    }
}
