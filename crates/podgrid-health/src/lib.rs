//! Health signals for podgrid.
//!
//! Nodes report pod health through per-node status endpoints. This crate
//! derives those endpoints from a manifest's status stanza and assembles
//! per-service views over an injected probe client: a one-shot snapshot and
//! a long-lived watch that emits the full node→result map whenever it
//! re-probes. The probe client itself is an external collaborator.
//!
//! # Components
//!
//! - **`state`** — the ordered `HealthState` and per-check `HealthResult`
//! - **`endpoint`** — status-endpoint derivation and its inverse
//! - **`client`** — the `HealthClient` probe interface
//! - **`checker`** — the `HealthChecker` trait, `Service` one-shot and
//!   `WatchService` streaming views
//! - **`error`** — `HealthError`

pub mod checker;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod state;

pub use checker::{
    HealthChecker, ProbingHealthChecker, ServiceResolver, ServiceSnapshot, MIN_WATCH_DELAY,
};
pub use client::HealthClient;
pub use endpoint::{endpoint_node, node_status_endpoint};
pub use error::HealthError;
pub use state::{HealthResult, HealthState};
