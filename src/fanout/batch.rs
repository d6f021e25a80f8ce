//! Partitioning of a node set into fan-out batches.

use crate::models::Lnn;
use std::fmt;

/// Node selection handed to the remote-execution program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    /// Run on exactly these nodes.
    Include(Vec<Lnn>),
    /// Run on every node except these.
    Exclude(Vec<Lnn>),
}

impl NodeTarget {
    /// The nodes this target reaches out of `all`.
    pub fn covers(&self, all: &[Lnn]) -> Vec<Lnn> {
        match self {
            NodeTarget::Include(lnns) => all.iter().copied().filter(|l| lnns.contains(l)).collect(),
            NodeTarget::Exclude(lnns) => all.iter().copied().filter(|l| !lnns.contains(l)).collect(),
        }
    }
}

impl fmt::Display for NodeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTarget::Include(lnns) => write!(f, "nodes {}", join_lnns(lnns)),
            NodeTarget::Exclude(lnns) if lnns.is_empty() => write!(f, "all nodes"),
            NodeTarget::Exclude(lnns) => write!(f, "all nodes except {}", join_lnns(lnns)),
        }
    }
}

/// Comma-separated lnn list, the form the remote-execution program expects.
pub fn join_lnns(lnns: &[Lnn]) -> String {
    lnns.iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Split `targets` into batches of `batch_size` consecutive nodes.
///
/// A batch size of 0 yields one exclusion-based batch instead of
/// enumerating nodes. Excluded nodes never appear in an include batch, and
/// nothing is produced when no node is left to run on.
pub fn partition(targets: &[Lnn], batch_size: usize, excluded: &[Lnn]) -> Vec<NodeTarget> {
    let effective: Vec<Lnn> = targets
        .iter()
        .copied()
        .filter(|l| !excluded.contains(l))
        .collect();
    if effective.is_empty() {
        return Vec::new();
    }

    if batch_size == 0 {
        return vec![NodeTarget::Exclude(excluded.to_vec())];
    }

    effective
        .chunks(batch_size)
        .map(|chunk| NodeTarget::Include(chunk.to_vec()))
        .collect()
}
