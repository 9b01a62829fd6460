//! Error types for manifest parsing.

use thiserror::Error;

/// Errors that can occur while parsing or building a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("manifest has an empty pod id")]
    EmptyId,
}
