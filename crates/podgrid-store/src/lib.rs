//! Coordination backend for podgrid.
//!
//! The backend exposes two logical pod trees: the **intent** tree, written
//! by the replication engine, and the **reality** tree, written by node
//! agents as they pick manifests up. Writes are grouped into explicit
//! [`Transaction`]s and committed atomically. Exclusive replication locks
//! are built on renewable [`Session`]s: owning the session owns the lock,
//! and destroying the session releases everything it held.
//!
//! # Components
//!
//! - **`store`** — the `Store`, `Session`, and `Labeler` traits
//! - **`txn`** — `Transaction`, its operations, and `CommitOutcome`
//! - **`local`** — `LocalStore`, a redb-backed single-process implementation
//! - **`types`** — trees, key paths, label types
//! - **`error`** — `StoreError`

pub mod error;
pub mod local;
pub mod store;
mod tables;
pub mod txn;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use local::LocalStore;
pub use store::{Labeler, Session, Store};
pub use txn::{CommitOutcome, Transaction, TxnOp};
pub use types::{
    pod_path, replication_lock_path, LabelSet, LabelType, PodTree, CONTROLLER_ID_LABEL,
};
