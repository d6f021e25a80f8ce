//! Per-cycle event accumulation.

use crate::models::{Event, Lnn, Severity};
use chrono::Local;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Events of one cycle, grouped by node and severity.
///
/// Entries are append-only between resets; rendering only filters and
/// groups, it never reorders events within a group.
#[derive(Debug, Default)]
pub struct EventLedger {
    known: BTreeSet<Lnn>,
    by_node: BTreeMap<Lnn, BTreeMap<Severity, Vec<Event>>>,
    cluster: Vec<Event>,
    recorded: usize,
}

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new cycle over the given node set.
    pub fn reset(&mut self, nodes: impl IntoIterator<Item = Lnn>) {
        self.known = nodes.into_iter().collect();
        self.by_node.clear();
        self.cluster.clear();
        self.recorded = 0;
    }

    /// Append an event and return it.
    ///
    /// An event naming a node outside the cycle's snapshot is kept as a
    /// cluster-wide event with the node folded into its text.
    pub fn record(&mut self, lnn: Option<Lnn>, severity: Severity, text: impl Into<String>) -> Event {
        let mut text = text.into();
        let lnn = match lnn {
            Some(l) if !self.known.contains(&l) => {
                warn!("Event for node {} which is not part of this cycle", l);
                text = format!("Node {}: {}", l, text);
                None
            }
            other => other,
        };

        let event = Event {
            lnn,
            severity,
            text,
            timestamp: Local::now(),
        };
        match lnn {
            Some(l) => self
                .by_node
                .entry(l)
                .or_default()
                .entry(severity)
                .or_default()
                .push(event.clone()),
            None => self.cluster.push(event.clone()),
        }
        self.recorded += 1;
        event
    }

    /// Events of one node and severity, in recording order.
    pub fn events(&self, lnn: Lnn, severity: Severity) -> &[Event] {
        self.by_node
            .get(&lnn)
            .and_then(|by_severity| by_severity.get(&severity))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes with at least one event of the given severity, ascending.
    pub fn nodes_with(&self, severity: Severity) -> Vec<Lnn> {
        self.by_node
            .iter()
            .filter(|(_, by_severity)| by_severity.get(&severity).is_some_and(|e| !e.is_empty()))
            .map(|(lnn, _)| *lnn)
            .collect()
    }

    /// Nodes with at least one ranked event, ascending.
    pub fn nodes_with_ranked(&self) -> Vec<Lnn> {
        self.by_node
            .iter()
            .filter(|(_, by_severity)| by_severity.keys().any(Severity::is_ranked))
            .map(|(lnn, _)| *lnn)
            .collect()
    }

    /// Cluster-wide events, in recording order.
    pub fn cluster_events(&self) -> &[Event] {
        &self.cluster
    }

    /// Node-attributed event counts per severity.
    pub fn severity_counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for by_severity in self.by_node.values() {
            for (severity, events) in by_severity {
                *counts.entry(*severity).or_insert(0) += events.len();
            }
        }
        counts
    }

    /// Every event recorded this cycle.
    pub fn len(&self) -> usize {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }
}
