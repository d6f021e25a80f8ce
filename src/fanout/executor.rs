//! Batched dispatch of one command across the cluster.

use super::batch::{join_lnns, partition, NodeTarget};
use super::demux::{Demultiplexer, Demuxed, Diagnostic, DiagnosticKind};
use crate::config::FanoutConfig;
use crate::models::Lnn;
use crate::shell::{quote, CommandOutput, Shell};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs a command on a set of nodes and returns the multiplexed output.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, command: &str, target: &NodeTarget, timeout: Duration) -> Result<CommandOutput>;
}

/// Remote execution through the cluster's for-array program.
pub struct ForArrayExecutor {
    shell: Arc<dyn Shell>,
    config: FanoutConfig,
}

impl ForArrayExecutor {
    pub fn new(shell: Arc<dyn Shell>, config: FanoutConfig) -> Self {
        Self { shell, config }
    }

    /// The full local command line for one batch.
    pub fn command_line(&self, command: &str, target: &NodeTarget) -> String {
        let mut line = String::new();
        if let Some(nice) = self.config.nice {
            line.push_str(&format!("nice -n {} ", nice));
        }
        line.push_str(&self.config.program);
        match target {
            NodeTarget::Include(lnns) => {
                line.push_str(&format!(" {} {}", self.config.include_flag, join_lnns(lnns)));
            }
            NodeTarget::Exclude(lnns) if !lnns.is_empty() => {
                line.push_str(&format!(" {} {}", self.config.exclude_flag, join_lnns(lnns)));
            }
            NodeTarget::Exclude(_) => {}
        }
        line.push(' ');
        line.push_str(&quote(command));
        line
    }
}

#[async_trait]
impl RemoteExecutor for ForArrayExecutor {
    async fn execute(&self, command: &str, target: &NodeTarget, timeout: Duration) -> Result<CommandOutput> {
        let line = self.command_line(command, target);
        debug!("Running \"{}\"", line);
        self.shell.run(&line, timeout).await
    }
}

/// A batch that counts as an execution error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub target: NodeTarget,
    pub reason: String,
}

/// Everything one dispatch produced.
#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    /// Failed batches, each one execution error.
    pub failures: Vec<BatchFailure>,
    /// Newline-terminated output lines per node.
    pub per_node: BTreeMap<Lnn, String>,
    /// Concatenated error stream of every batch.
    pub stderr: String,
    /// Lines that needed splitting or could not be attributed.
    pub diagnostics: Vec<Diagnostic>,
    /// Nodes of batches that failed or exited non-zero without output.
    pub unanswered: BTreeSet<Lnn>,
}

impl DispatchResult {
    pub fn execution_errors(&self) -> u32 {
        self.failures.len() as u32
    }

    /// Whether missing output from `lnn` is already explained by its batch,
    /// so it must not be counted again per node.
    pub fn accounted(&self, lnn: Lnn) -> bool {
        self.unanswered.contains(&lnn)
    }

    /// Output of one node, empty when it printed nothing.
    pub fn output(&self, lnn: Lnn) -> &str {
        self.per_node.get(&lnn).map_or("", String::as_str)
    }
}

/// Dispatches commands to the online nodes of one cluster.
pub struct FanoutExecutor {
    remote: Arc<dyn RemoteExecutor>,
    demux: Demultiplexer,
    timeout: Duration,
}

impl FanoutExecutor {
    pub fn new(remote: Arc<dyn RemoteExecutor>, demux: Demultiplexer, timeout: Duration) -> Self {
        Self {
            remote,
            demux,
            timeout,
        }
    }

    /// Run `command` on `targets` minus `excluded`, `batch_size` nodes at
    /// a time (0 for one exclusion-based batch).
    ///
    /// Batches target disjoint nodes and run concurrently; their output is
    /// merged in batch order. A batch that exits non-zero is an execution
    /// error unless `ignore_failures` is set or it printed nothing. A batch
    /// that times out is always an execution error.
    pub async fn dispatch(
        &self,
        command: &str,
        targets: &[Lnn],
        batch_size: usize,
        excluded: &[Lnn],
        ignore_failures: bool,
    ) -> DispatchResult {
        let batches = partition(targets, batch_size, excluded);
        let expected: Vec<Lnn> = targets
            .iter()
            .copied()
            .filter(|l| !excluded.contains(l))
            .collect();

        let runs = batches
            .iter()
            .map(|target| self.remote.execute(command, target, self.timeout));
        let outputs = join_all(runs).await;

        let mut result = DispatchResult::default();
        let mut merged = Demuxed::default();

        for (target, output) in batches.into_iter().zip(outputs) {
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    warn!("Fan-out to {} failed to start: {:#}", target, e);
                    result.unanswered.extend(target.covers(&expected));
                    result.failures.push(BatchFailure {
                        target,
                        reason: format!("error running \"{}\" => {:#}", command, e),
                    });
                    continue;
                }
            };

            if !output.stderr.trim().is_empty() {
                result.stderr.push_str(&output.stderr);
                if !output.stderr.ends_with('\n') {
                    result.stderr.push('\n');
                }
            }

            if output.timed_out {
                result.unanswered.extend(target.covers(&expected));
                result.failures.push(BatchFailure {
                    target: target.clone(),
                    reason: format!(
                        "\"{}\" on {} timed out after {}s",
                        command,
                        target,
                        self.timeout.as_secs()
                    ),
                });
            } else if output.exit_code != Some(0) && !ignore_failures {
                result.unanswered.extend(target.covers(&expected));
                if output.stdout.trim().is_empty() {
                    debug!("Ignoring failed batch with empty output on {}", target);
                } else {
                    result.failures.push(BatchFailure {
                        target: target.clone(),
                        reason: format!(
                            "error running \"{}\" on {} (exit {}) =>  {}  <=",
                            command,
                            target,
                            output
                                .exit_code
                                .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                            output.stdout.trim_end()
                        ),
                    });
                }
            }

            merged.merge(self.demux.demux(&output.stdout));
        }

        // Output claiming to come from a node that was not asked is never
        // attributed.
        for (lnn, text) in merged.per_node {
            if expected.contains(&lnn) {
                result.per_node.insert(lnn, text);
            } else {
                for line in text.lines() {
                    merged.diagnostics.push(Diagnostic {
                        kind: DiagnosticKind::UnknownNode,
                        line: format!("{}: {}", lnn, line),
                    });
                }
            }
        }
        result.diagnostics = merged.diagnostics;

        result
    }
}
