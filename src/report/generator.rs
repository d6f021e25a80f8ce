//! Report summary rendering.
//!
//! Turns the ledger, the run totals and the cluster snapshot into the
//! lines of the summary section. Rendering is pure; the aggregator decides
//! which destinations receive the lines.

use super::ledger::EventLedger;
use crate::config::SortOrder;
use crate::models::{ClusterSnapshot, ErrorTotals, Lnn, Severity};
use std::path::PathBuf;

/// One line of rendered summary output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryLine {
    pub severity: Severity,
    /// Node the line reports on, for event lines.
    pub lnn: Option<Lnn>,
    pub text: String,
    /// Section or group heading rather than an event.
    pub heading: bool,
}

impl SummaryLine {
    fn heading(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            lnn: None,
            text: text.into(),
            heading: true,
        }
    }

    fn info(text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            lnn: None,
            text: text.into(),
            heading: false,
        }
    }

    fn event(severity: Severity, lnn: Lnn, text: String) -> Self {
        Self {
            severity,
            lnn: Some(lnn),
            text,
            heading: false,
        }
    }
}

/// Everything the summary reports besides the ledger.
#[derive(Debug, Clone)]
pub struct SummaryContext<'a> {
    pub snapshot: &'a ClusterSnapshot,
    pub totals: ErrorTotals,
    pub log_file: PathBuf,
    pub trend_files: Vec<PathBuf>,
    pub elapsed_minutes: f64,
    pub sort: SortOrder,
}

/// `singular` when `count <= 1`, otherwise `plural`.
pub fn pluralize<'a>(count: u32, singular: &'a str, plural: &'a str) -> &'a str {
    if count <= 1 {
        singular
    } else {
        plural
    }
}

/// Split a `BUG-1234: text` line into the reference and the rest.
pub fn split_bug_ref(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with("BUG") {
        return None;
    }
    line.split_once(':')
        .map(|(bug, rest)| (bug.trim_end(), rest.trim_start()))
}

/// A sorted-section event line, with any bug reference pulled to the front.
fn event_text(lnn: Lnn, line: &str, with_node: bool) -> String {
    match split_bug_ref(line) {
        Some((bug, rest)) => format!("{} : Node {}: {}", bug, lnn, rest),
        None if with_node => format!("Node {}: {}", lnn, line),
        None => line.to_string(),
    }
}

/// Lines of one node/severity group.
fn group_lines(ledger: &EventLedger, lnn: Lnn, severity: Severity, with_node: bool) -> Vec<SummaryLine> {
    ledger
        .events(lnn, severity)
        .iter()
        .flat_map(|event| event.text.lines())
        .filter(|line| !line.trim().is_empty())
        .map(|line| SummaryLine::event(severity, lnn, event_text(lnn, line, with_node)))
        .collect()
}

/// The sorted event section.
///
/// `Node` groups by node then severity; `Totals` groups by severity then
/// node. Both contain the same event lines.
pub fn sorted_section(ledger: &EventLedger, order: SortOrder) -> Vec<SummaryLine> {
    let mut lines = Vec::new();
    match order {
        SortOrder::Off => {}
        SortOrder::Node => {
            for lnn in ledger.nodes_with_ranked() {
                lines.push(SummaryLine::heading(format!("Node {} events:", lnn)));
                for severity in Severity::RANKED {
                    lines.extend(group_lines(ledger, lnn, severity, true));
                }
            }
        }
        SortOrder::Totals => {
            for severity in Severity::RANKED {
                lines.push(SummaryLine::heading(format!("{}:", severity.tag())));
                for lnn in ledger.nodes_with(severity) {
                    lines.push(SummaryLine::heading(format!("Node {}:", lnn)));
                    lines.extend(group_lines(ledger, lnn, severity, false));
                }
            }
        }
    }
    lines
}

/// The pluralized totals block.
pub fn totals_lines(totals: &ErrorTotals) -> Vec<String> {
    vec![
        "Totals:".to_string(),
        format!(
            "FAIL: {} {}",
            totals.threshold_errors,
            pluralize(totals.threshold_errors, "error", "errors")
        ),
        format!(
            "LEAKS: {} {}",
            totals.leaks,
            pluralize(totals.leaks, "leak", "leaks")
        ),
        format!(
            "EXEC: {} {}",
            totals.execution_errors,
            pluralize(totals.execution_errors, "execution error", "execution errors")
        ),
    ]
}

/// Mail subject line for a finished cycle.
pub fn mail_subject(totals: &ErrorTotals, cluster: &str) -> String {
    format!(
        "clustercheck: {} {}, {} {}, {} {} (cluster {})",
        totals.threshold_errors,
        pluralize(totals.threshold_errors, "error", "errors"),
        totals.leaks,
        pluralize(totals.leaks, "leak", "leaks"),
        totals.execution_errors,
        pluralize(totals.execution_errors, "execution error", "execution errors"),
        cluster
    )
}

fn lnn_list(lnns: &[Lnn]) -> String {
    let items: Vec<String> = lnns.iter().map(|l| l.to_string()).collect();
    format!("[{}]", items.join(", "))
}

/// Cluster identity block.
pub fn cluster_summary(snapshot: &ClusterSnapshot) -> Vec<String> {
    let coordinator = snapshot
        .local_node()
        .map(|n| format!("{} ({})", n.hostname, n.ip_address))
        .unwrap_or_else(|| format!("lnn {}", snapshot.local_lnn));
    let all: Vec<Lnn> = snapshot.nodes.keys().copied().collect();

    vec![
        format!("Cluster name        :  {}", snapshot.name),
        format!("Coordinator node    :  {}", coordinator),
        format!("Number of Nodes     :  {}", lnn_list(&all)),
        format!("Nodes Online        :  {}", lnn_list(&snapshot.online())),
        format!("Software version    :  {}", snapshot.software_version),
        format!("Software build      :  {}", snapshot.build),
        format!("Hardware platform   :  {}", snapshot.hardware),
    ]
}

/// The complete summary section.
pub fn render_summary(ledger: &EventLedger, ctx: &SummaryContext<'_>) -> Vec<SummaryLine> {
    let mut lines = vec![
        SummaryLine::heading("REPORT SUMMARY:"),
        SummaryLine::info(format!("Results saved to {}.", ctx.log_file.display())),
    ];
    for file in &ctx.trend_files {
        lines.push(SummaryLine::info(format!("Trend data saved to {}.", file.display())));
    }
    lines.push(SummaryLine::info(format!(
        "Elapsed Time: {:.2} Min",
        ctx.elapsed_minutes
    )));
    lines.push(SummaryLine::info(format!(
        "clustercheck version {}",
        env!("CARGO_PKG_VERSION")
    )));

    lines.extend(cluster_summary(ctx.snapshot).into_iter().map(SummaryLine::info));
    lines.extend(totals_lines(&ctx.totals).into_iter().map(SummaryLine::info));
    lines.extend(sorted_section(ledger, ctx.sort));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Node, NodeStatus};
    use std::collections::BTreeMap;

    fn populated_ledger() -> EventLedger {
        let mut ledger = EventLedger::new();
        ledger.reset([Lnn(1), Lnn(2), Lnn(3)]);
        ledger.record(Some(Lnn(2)), Severity::Fail, "disk full");
        ledger.record(Some(Lnn(1)), Severity::Fail, "BUG-1234: known crash\nsecond line");
        ledger.record(Some(Lnn(1)), Severity::Exec, "probe failed");
        ledger.record(Some(Lnn(3)), Severity::CurrentLeak, "wired pages rising");
        ledger.record(Some(Lnn(3)), Severity::Pass, "ok");
        ledger.record(None, Severity::Info, "cluster note");
        ledger
    }

    fn snapshot() -> ClusterSnapshot {
        let mut nodes = BTreeMap::new();
        for lnn in 1..=2 {
            nodes.insert(
                Lnn(lnn),
                Node {
                    lnn: Lnn(lnn),
                    id: lnn,
                    hostname: format!("tc-{}", lnn),
                    ip_address: format!("10.0.0.{}", lnn),
                    status: if lnn == 1 {
                        NodeStatus::Online
                    } else {
                        NodeStatus::OfflineUnreachable
                    },
                },
            );
        }
        ClusterSnapshot {
            name: "tc".to_string(),
            software_version: "v9.1".to_string(),
            build: "B_9_1".to_string(),
            hardware: "HWGen: Gen6".to_string(),
            local_lnn: Lnn(1),
            nodes,
        }
    }

    fn event_counts(lines: &[SummaryLine]) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for line in lines.iter().filter(|l| !l.heading) {
            *counts.entry(line.severity).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_split_bug_ref() {
        assert_eq!(split_bug_ref("BUG-12: broken"), Some(("BUG-12", "broken")));
        assert_eq!(split_bug_ref("no bug: here"), None);
        assert_eq!(split_bug_ref("BUG without colon"), None);
    }

    #[test]
    fn test_orderings_have_same_events() {
        let ledger = populated_ledger();
        let by_node = sorted_section(&ledger, SortOrder::Node);
        let by_severity = sorted_section(&ledger, SortOrder::Totals);

        assert_eq!(event_counts(&by_node), event_counts(&by_severity));
        assert_eq!(event_counts(&by_node)[&Severity::Fail], 3);
        assert!(!event_counts(&by_node).contains_key(&Severity::Pass));
        assert!(sorted_section(&ledger, SortOrder::Off).is_empty());
    }

    #[test]
    fn test_by_node_order() {
        let lines = sorted_section(&populated_ledger(), SortOrder::Node);
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Node 1 events:",
                "BUG-1234 : Node 1: known crash",
                "Node 1: second line",
                "Node 1: probe failed",
                "Node 2 events:",
                "Node 2: disk full",
                "Node 3 events:",
                "Node 3: wired pages rising",
            ]
        );
    }

    #[test]
    fn test_by_severity_order() {
        let lines = sorted_section(&populated_ledger(), SortOrder::Totals);
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "FAIL:",
                "Node 1:",
                "BUG-1234 : Node 1: known crash",
                "second line",
                "Node 2:",
                "disk full",
                "EXEC:",
                "Node 1:",
                "probe failed",
                "CRNT_LEAK:",
                "Node 3:",
                "wired pages rising",
                "PAST_LEAK:",
            ]
        );
    }

    #[test]
    fn test_totals_pluralization() {
        let lines = totals_lines(&ErrorTotals {
            execution_errors: 1,
            threshold_errors: 2,
            leaks: 0,
        });
        assert_eq!(lines[1], "FAIL: 2 errors");
        assert_eq!(lines[2], "LEAKS: 0 leak");
        assert_eq!(lines[3], "EXEC: 1 execution error");
    }

    #[test]
    fn test_mail_subject() {
        let subject = mail_subject(
            &ErrorTotals {
                execution_errors: 3,
                threshold_errors: 1,
                leaks: 2,
            },
            "tc",
        );
        assert_eq!(
            subject,
            "clustercheck: 1 error, 2 leaks, 3 execution errors (cluster tc)"
        );
    }

    #[test]
    fn test_render_summary_sections() {
        let ledger = populated_ledger();
        let snapshot = snapshot();
        let ctx = SummaryContext {
            snapshot: &snapshot,
            totals: ErrorTotals::default(),
            log_file: PathBuf::from("/logs/check_cluster_x.html"),
            trend_files: vec![PathBuf::from("/logs/mem_clustercheck_tracking.csv")],
            elapsed_minutes: 1.5,
            sort: SortOrder::Off,
        };
        let lines = render_summary(&ledger, &ctx);
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();

        assert_eq!(texts[0], "REPORT SUMMARY:");
        assert!(texts.contains(&"Results saved to /logs/check_cluster_x.html."));
        assert!(texts.contains(&"Elapsed Time: 1.50 Min"));
        assert!(texts.contains(&"Coordinator node    :  tc-1 (10.0.0.1)"));
        assert!(texts.contains(&"Nodes Online        :  [1]"));
        assert!(texts.contains(&"FAIL: 0 error"));
        assert_eq!(*texts.last().unwrap(), "EXEC: 0 execution error");
    }
}
