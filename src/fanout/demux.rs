//! Demultiplexing of fan-out output into per-node text.
//!
//! The remote-execution program prints every line as
//! `<cluster>-<lnn>: <data>`. Concurrent writers on different nodes can
//! interleave, so a line's data may itself carry the prefix of another
//! node. Such lines are split at each embedded prefix, up to three
//! segments per line. A prefix preceded by `@` is a build location
//! (`user@cluster-3:`), not a node, and lines containing one of the safe
//! substrings are never split.

use crate::models::Lnn;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Most node segments a single line may be split into.
pub const MAX_SEGMENTS: usize = 3;

/// Why a line needed attention during demultiplexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The line has no node prefix; it was dropped.
    Unmatched,
    /// The line carried two node prefixes and was split.
    Doubled,
    /// The line carried three node prefixes and was split.
    Tripled,
    /// The line carried more prefixes than can be resolved; it was dropped.
    TooDeep,
    /// The line named a node that was not targeted; it was dropped.
    UnknownNode,
}

/// A line that could not be attributed as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: String,
}

impl Diagnostic {
    /// Whether the line was dropped from attribution.
    pub fn dropped(&self) -> bool {
        matches!(
            self.kind,
            DiagnosticKind::Unmatched | DiagnosticKind::TooDeep | DiagnosticKind::UnknownNode
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            DiagnosticKind::Unmatched => "UNMATCHED LINE",
            DiagnosticKind::Doubled => "FOUND DOUBLED LINE",
            DiagnosticKind::Tripled => "FOUND TRIPLE LINE",
            DiagnosticKind::TooDeep => "UNRESOLVED MULTIPLE LINE",
            DiagnosticKind::UnknownNode => "LINE FOR UNTARGETED NODE",
        };
        write!(f, "{}: ->{}<-", what, self.line)
    }
}

/// Per-node output of one or more batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demuxed {
    /// Newline-terminated lines attributed to each node, in output order.
    pub per_node: BTreeMap<Lnn, String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Demuxed {
    /// Fold another result into this one, keeping order.
    pub fn merge(&mut self, other: Demuxed) {
        for (lnn, text) in other.per_node {
            self.per_node.entry(lnn).or_default().push_str(&text);
        }
        self.diagnostics.extend(other.diagnostics);
    }
}

/// Splits output for one cluster name.
#[derive(Debug, Clone)]
pub struct Demultiplexer {
    line_prefix: Regex,
    embedded_prefix: Regex,
    safe_substrings: Vec<String>,
}

impl Demultiplexer {
    pub fn new(cluster_name: &str, safe_substrings: Vec<String>) -> Result<Self, regex::Error> {
        let name = regex::escape(cluster_name);
        Ok(Self {
            line_prefix: Regex::new(&format!(r"^{}-([0-9]+):\s*(.*)$", name))?,
            embedded_prefix: Regex::new(&format!(r"{}-([0-9]+):\s*", name))?,
            safe_substrings,
        })
    }

    /// Attribute every line of `output` to its node.
    pub fn demux(&self, output: &str) -> Demuxed {
        let mut result = Demuxed::default();

        for raw in output.lines() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            let Some(caps) = self.line_prefix.captures(line) else {
                result.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Unmatched,
                    line: line.to_string(),
                });
                continue;
            };
            let Ok(lnn) = caps[1].parse::<Lnn>() else {
                result.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Unmatched,
                    line: line.to_string(),
                });
                continue;
            };
            let data = caps.get(2).map_or("", |m| m.as_str());

            let segments = match self.split_segments(lnn, data) {
                Some(segments) => segments,
                None => {
                    result.diagnostics.push(Diagnostic {
                        kind: DiagnosticKind::TooDeep,
                        line: line.to_string(),
                    });
                    continue;
                }
            };

            match segments.len() {
                2 => result.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Doubled,
                    line: line.to_string(),
                }),
                3 => result.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Tripled,
                    line: line.to_string(),
                }),
                _ => {}
            }

            let single = segments.len() == 1;
            for (node, fragment) in segments {
                // An embedded prefix right at the start leaves nothing for
                // the outer node.
                if fragment.is_empty() && !single {
                    continue;
                }
                let text = result.per_node.entry(node).or_default();
                text.push_str(fragment);
                text.push('\n');
            }
        }

        result
    }

    /// Position of the first embedded prefix that is not a build location:
    /// (start of prefix, lnn, start of the following data).
    fn find_embedded(&self, data: &str) -> Option<(usize, Lnn, usize)> {
        self.embedded_prefix.captures_iter(data).find_map(|caps| {
            let whole = caps.get(0)?;
            if data[..whole.start()].ends_with('@') {
                return None;
            }
            let lnn = caps[1].parse::<Lnn>().ok()?;
            Some((whole.start(), lnn, whole.end()))
        })
    }

    /// Split a line's data at embedded prefixes. `None` when the line holds
    /// more than [`MAX_SEGMENTS`] segments.
    fn split_segments<'a>(&self, lnn: Lnn, data: &'a str) -> Option<Vec<(Lnn, &'a str)>> {
        if self.safe_substrings.iter().any(|s| data.contains(s.as_str())) {
            return Some(vec![(lnn, data)]);
        }

        let mut segments = Vec::new();
        let mut current = (lnn, data);
        while let Some((start, next, rest)) = self.find_embedded(current.1) {
            if segments.len() + 2 > MAX_SEGMENTS {
                return None;
            }
            segments.push((current.0, current.1[..start].trim_end()));
            current = (next, &current.1[rest..]);
        }
        segments.push(current);
        Some(segments)
    }
}
