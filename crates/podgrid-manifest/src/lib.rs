//! Pod manifest model for podgrid.
//!
//! A manifest is the immutable, declarative description of a pod. It is
//! identified by the SHA-256 of its raw YAML bytes, so two manifests are
//! "the same deploy" exactly when their content hashes match.
//!
//! # Components
//!
//! - **`types`** — `PodId` and `NodeName` string identities
//! - **`manifest`** — `Manifest`, `StatusStanza`, and the builder
//! - **`error`** — `ManifestError`

pub mod error;
pub mod manifest;
pub mod types;

pub use error::ManifestError;
pub use manifest::{Manifest, ManifestBuilder, StatusStanza};
pub use types::{pod_label_key, NodeName, PodId};
