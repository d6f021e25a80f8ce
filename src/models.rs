//! Data models for the cluster checker.
//!
//! This module contains the core data structures shared by the fan-out
//! executor, the check runner, the trend analyzer and the report layer:
//! node identity, the per-cycle cluster snapshot, severities, events and
//! check outcomes.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

/// Logical node number: the cluster-local ordinal of a node.
///
/// This is the identifier that appears in fan-out line prefixes
/// (`<cluster>-<lnn>: ...`) and the key every event is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lnn(pub u32);

impl fmt::Display for Lnn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Lnn {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Lnn)
    }
}

/// Reachability of a node for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is in the up set and can be queried.
    Online,
    /// Node is down and did not answer a status probe.
    OfflineUnreachable,
    /// Node answers but its filesystem is unmounted.
    OfflineUnmounted,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::OfflineUnreachable => write!(f, "offline"),
            NodeStatus::OfflineUnmounted => write!(f, "unmounted"),
        }
    }
}

/// A cluster member as seen by one polling cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Logical node number.
    pub lnn: Lnn,
    /// Cluster-assigned device id (distinct from the lnn).
    pub id: u32,
    /// Node hostname.
    pub hostname: String,
    /// External IP address.
    pub ip_address: String,
    /// Reachability for this cycle.
    pub status: NodeStatus,
}

/// Cluster-wide metadata plus the node set of the active cycle.
///
/// Rebuilt every cycle in daemon mode; never shared between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Cluster name (the hostname prefix of every node).
    pub name: String,
    /// Software release string.
    pub software_version: String,
    /// Software build identifier.
    pub build: String,
    /// Hardware generation as reported by the platform tools.
    pub hardware: String,
    /// Lnn of the node this process runs on.
    pub local_lnn: Lnn,
    /// Every known node keyed by lnn.
    pub nodes: BTreeMap<Lnn, Node>,
}

impl ClusterSnapshot {
    /// Lnns of the nodes with the given status, ascending.
    pub fn lnns_with(&self, status: NodeStatus) -> Vec<Lnn> {
        self.nodes
            .values()
            .filter(|n| n.status == status)
            .map(|n| n.lnn)
            .collect()
    }

    /// Online lnns, ascending.
    pub fn online(&self) -> Vec<Lnn> {
        self.lnns_with(NodeStatus::Online)
    }

    /// Offline (unreachable) lnns, ascending.
    pub fn offline(&self) -> Vec<Lnn> {
        self.lnns_with(NodeStatus::OfflineUnreachable)
    }

    /// Unmounted lnns, ascending.
    pub fn unmounted(&self) -> Vec<Lnn> {
        self.lnns_with(NodeStatus::OfflineUnmounted)
    }

    /// Every lnn that is not online. These are excluded from fan-out.
    pub fn not_online(&self) -> Vec<Lnn> {
        self.nodes
            .values()
            .filter(|n| n.status != NodeStatus::Online)
            .map(|n| n.lnn)
            .collect()
    }

    /// The node this process runs on, if it is part of the listing.
    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.get(&self.local_lnn)
    }

    /// Whether an lnn belongs to this snapshot.
    pub fn contains(&self, lnn: Lnn) -> bool {
        self.nodes.contains_key(&lnn)
    }
}

/// Fixed presentation rules for one severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoration {
    /// Label placed in front of the text (may be empty).
    pub label: &'static str,
    /// ANSI SGR code for console output.
    pub ansi: &'static str,
    /// Opening HTML markup for persistent destinations.
    pub html_open: &'static str,
    /// Closing HTML markup for persistent destinations.
    pub html_close: &'static str,
}

/// Classification of a report event.
///
/// Each variant carries its decoration and ledger routing as data, so call
/// sites never branch on a numeric status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fail,
    Exec,
    CurrentLeak,
    PastLeak,
    Warn,
    Info,
    Banner,
    Pass,
    Summary,
}

impl Severity {
    /// Severities that are ranked in the sorted report, in priority order.
    pub const RANKED: [Severity; 4] = [
        Severity::Fail,
        Severity::Exec,
        Severity::CurrentLeak,
        Severity::PastLeak,
    ];

    /// Whether node-attributed events of this severity appear in the sorted
    /// report section.
    pub fn is_ranked(&self) -> bool {
        Self::RANKED.contains(self)
    }

    /// Short tag used as a section heading in the sorted report.
    pub fn tag(&self) -> &'static str {
        match self {
            Severity::Fail => "FAIL",
            Severity::Exec => "EXEC",
            Severity::CurrentLeak => "CRNT_LEAK",
            Severity::PastLeak => "PAST_LEAK",
            Severity::Warn => "WARN",
            Severity::Info => "INFO",
            Severity::Banner => "BANNER",
            Severity::Pass => "PASS",
            Severity::Summary => "SUMMARY",
        }
    }

    /// Presentation rules for this severity.
    pub fn decoration(&self) -> Decoration {
        match self {
            Severity::Info => Decoration {
                label: "",
                ansi: "37",
                html_open: "<h5>",
                html_close: "</h5>",
            },
            Severity::Warn => Decoration {
                label: "WARN:  ",
                ansi: "1;31",
                html_open: r##"<h5><font color="#800080" style="font-weight: bold">"##,
                html_close: "</font></h5>",
            },
            Severity::Banner => Decoration {
                label: "",
                ansi: "34",
                html_open: r##"<h5><font color="#0000FF">"##,
                html_close: "</font></h5>",
            },
            Severity::Pass => Decoration {
                label: "PASS:  ",
                ansi: "1;32",
                html_open: r##"<font color="#00FF00" style="font-weight: bold">"##,
                html_close: "</font>",
            },
            Severity::Fail => Decoration {
                label: " FAIL:  ",
                ansi: "1;31",
                html_open: r##"<pre><font color="#FF0000" style="font-weight: bold">"##,
                html_close: "</font></pre>",
            },
            Severity::Exec => Decoration {
                label: " EXEC:  ",
                ansi: "1;31",
                html_open: r##"<pre><font color="#800080" style="font-weight: bold">"##,
                html_close: "</font></pre>",
            },
            Severity::CurrentLeak => Decoration {
                label: " CRNT_LEAK:  ",
                ansi: "32",
                html_open: r##"<pre><font color="#FF8040" style="font-weight: bold">"##,
                html_close: "</font></pre>",
            },
            Severity::PastLeak => Decoration {
                label: " PAST_LEAK:  ",
                ansi: "33",
                html_open: r##"<pre><font color="#FF8040" style="font-weight: bold">"##,
                html_close: "</font></pre>",
            },
            Severity::Summary => Decoration {
                label: "",
                ansi: "1;31",
                html_open: r##"<font color="#800080" style="font-weight: bold">"##,
                html_close: "</font>",
            },
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// A single report line produced during a cycle. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Node the event is attributed to; `None` for cluster-wide events.
    pub lnn: Option<Lnn>,
    /// Classification of the event.
    pub severity: Severity,
    /// Event text (may span several lines).
    pub text: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Local>,
}

/// Result every check returns.
///
/// Checks may report two counts or three; `leaks` stays `None` for checks
/// that do not track trends. Both tuple shapes convert into this type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Failures to run the underlying probe.
    pub execution_errors: u32,
    /// Conditions that failed a configured pass/fail bound.
    pub threshold_errors: u32,
    /// Leaks detected by trend analysis, for leak-class checks.
    pub leaks: Option<u32>,
}

impl CheckOutcome {
    /// Whether the outcome contains no errors and no leaks.
    pub fn is_clean(&self) -> bool {
        self.execution_errors == 0 && self.threshold_errors == 0 && self.leaks.unwrap_or(0) == 0
    }
}

impl From<(u32, u32)> for CheckOutcome {
    fn from((execution_errors, threshold_errors): (u32, u32)) -> Self {
        Self {
            execution_errors,
            threshold_errors,
            leaks: None,
        }
    }
}

impl From<(u32, u32, u32)> for CheckOutcome {
    fn from((execution_errors, threshold_errors, leaks): (u32, u32, u32)) -> Self {
        Self {
            execution_errors,
            threshold_errors,
            leaks: Some(leaks),
        }
    }
}

/// Error tally of a cycle (or of a whole single-report run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTotals {
    pub execution_errors: u32,
    pub threshold_errors: u32,
    pub leaks: u32,
}

impl ErrorTotals {
    /// Whether the totals make the run fail. Leaks alone never do.
    pub fn is_failure(&self) -> bool {
        self.execution_errors > 0 || self.threshold_errors > 0
    }

    /// Add an outcome. Deferred outcomes only contribute their leaks.
    pub fn add_outcome(&mut self, outcome: &CheckOutcome, deferred: bool) {
        if !deferred {
            self.execution_errors += outcome.execution_errors;
            self.threshold_errors += outcome.threshold_errors;
        }
        self.leaks += outcome.leaks.unwrap_or(0);
    }
}

impl AddAssign for ErrorTotals {
    fn add_assign(&mut self, rhs: Self) {
        self.execution_errors += rhs.execution_errors;
        self.threshold_errors += rhs.threshold_errors;
        self.leaks += rhs.leaks;
    }
}

/// One row of a durable trend series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSample {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Node the value was sampled on.
    pub lnn: Lnn,
    /// Metric label within the family (e.g. `wired_pages`).
    pub label: String,
    /// Sampled value.
    pub value: f64,
    /// Unit of the value, informational.
    pub unit: String,
}

/// Leak classification of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakClass {
    NoTrend,
    PastLeak,
    CurrentLeak,
}

impl fmt::Display for LeakClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakClass::NoTrend => write!(f, "no trend"),
            LeakClass::PastLeak => write!(f, "past leak"),
            LeakClass::CurrentLeak => write!(f, "current leak"),
        }
    }
}

/// Regression statistics of a series plus its classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub slope: f64,
    pub intercept: f64,
    pub correlation: f64,
    /// Number of valid samples the fit used.
    pub samples: usize,
    pub classification: LeakClass,
}

impl TrendResult {
    /// The undefined fit: zero statistics, no trend.
    pub fn none(samples: usize) -> Self {
        Self {
            slope: 0.0,
            intercept: 0.0,
            correlation: 0.0,
            samples,
            classification: LeakClass::NoTrend,
        }
    }
}
