//! Trees, key paths, and label types.

use std::collections::BTreeMap;
use std::fmt;

use podgrid_manifest::{NodeName, PodId};

/// The two logical pod trees in the coordination backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodTree {
    /// What should run on a node. Written by controllers.
    Intent,
    /// What a node has actually picked up. Written by node agents.
    Reality,
}

impl PodTree {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodTree::Intent => "intent",
            PodTree::Reality => "reality",
        }
    }
}

impl fmt::Display for PodTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a pod manifest within a tree: `<tree>/<node>/<pod-id>`.
pub fn pod_path(tree: PodTree, node: &NodeName, pod: &PodId) -> String {
    format!("{tree}/{node}/{pod}")
}

/// Path of the exclusive replication lock for a pod.
pub fn replication_lock_path(pod: &PodId) -> String {
    format!("lock/replication/{pod}")
}

/// Label applied to pods that are owned by a controller. Replications must
/// not touch pods carrying it.
pub const CONTROLLER_ID_LABEL: &str = "controller_id";

/// Namespaces for labeled objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelType {
    Pod,
    Node,
}

impl LabelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::Pod => "pod",
            LabelType::Node => "node",
        }
    }
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of labels on one object.
pub type LabelSet = BTreeMap<String, String>;
