//! Rolling pod replication for podgrid.
//!
//! A replication drives a set of nodes from whatever they are running to a
//! target manifest, a bounded number of nodes at a time.
//! Nodes deploy worst-health first; each node must pick the manifest up
//! (reality matches intent) and then report health at or above a threshold
//! before it counts as done. The whole run holds an exclusive per-pod lock
//! whose session is renewed for the duration; losing the session aborts
//! the run.
//!
//! # Components
//!
//! - **`order`** — health-weighted rollout ordering
//! - **`aggregator`** — one health watch per pod, shared by all workers
//! - **`replicator`** — locking, preflight, and construction of runs
//! - **`replication`** — the run itself: feeder, worker pool, per-node updater
//! - **`error`** — `ReplicationError` and the per-node error taxonomy

pub mod aggregator;
pub mod error;
pub mod order;
pub mod replication;
pub mod replicator;

pub use aggregator::PodHealth;
pub use error::ReplicationError;
pub use order::sort_for_rollout;
pub use replication::{Replication, DEFAULT_HEALTH_POLL_PERIOD, DEFAULT_REALITY_POLL_PERIOD};
pub use replicator::{ReplicationOptions, Replicator};
