//! Explicit write transactions.
//!
//! A [`Transaction`] accumulates pod and label writes that must land
//! atomically. Builders append operations; [`crate::Store::commit_with_retries`]
//! applies them all or none.

use podgrid_manifest::{Manifest, NodeName};

use crate::types::{LabelSet, LabelType, PodTree};

/// One operation within a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Write a manifest under a pod tree.
    SetPod {
        tree: PodTree,
        node: NodeName,
        manifest: Manifest,
    },
    /// Replace the labels on an object.
    SetLabels {
        label_type: LabelType,
        id: String,
        labels: LabelSet,
    },
}

/// An ordered batch of writes committed atomically.
#[derive(Debug, Default)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: TxnOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Result of a commit that reached the backend.
///
/// A conflict is a normal outcome, not an error: it means another writer won
/// a compare-and-set race and the caller should decide whether to rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Conflict(String),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}
