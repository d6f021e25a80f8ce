//! Diagnostic checks and their registry.
//!
//! A check is one async capability: inspect the cluster through the
//! [`CheckContext`] and return a [`CheckOutcome`]. Checks are registered by
//! name in a [`CheckRegistry`] at startup.

pub mod filehandles;
pub mod leak;
pub mod memory;
pub mod runner;
pub mod uptime;

pub use runner::CheckRunner;

use crate::config::{ChecksConfig, ThresholdConfig};
use crate::error::ClusterCheckError;
use crate::fanout::{DispatchResult, FanoutExecutor};
use crate::models::{CheckOutcome, ClusterSnapshot, Lnn, Severity};
use crate::report::Reporter;
use crate::trend::{TrendAnalyzer, TrendStores};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// Everything a check may use while it runs. Built once per cycle.
pub struct CheckContext<'a> {
    pub snapshot: &'a ClusterSnapshot,
    pub fanout: &'a FanoutExecutor,
    pub reporter: &'a mut Reporter,
    pub trend_stores: &'a mut TrendStores,
    pub analyzer: TrendAnalyzer,
    pub thresholds: &'a ThresholdConfig,
    pub batch_size: usize,
    /// Cycle timestamp, seconds since the epoch. Every trend sample of the
    /// cycle carries it.
    pub timestamp: i64,
}

impl CheckContext<'_> {
    pub fn record(&mut self, lnn: Option<Lnn>, severity: Severity, text: impl Into<String>) {
        self.reporter.record(lnn, severity, text);
    }

    /// Report a node whose output could not be read and return the
    /// execution errors it adds: none when its batch was already counted
    /// or exited non-zero without output.
    pub fn unreadable(&mut self, result: &DispatchResult, lnn: Lnn, text: String) -> u32 {
        if result.accounted(lnn) {
            self.record(Some(lnn), Severity::Warn, text);
            0
        } else {
            self.record(Some(lnn), Severity::Exec, text);
            1
        }
    }

    /// Run `command` on every online node and report what went wrong.
    ///
    /// Failed batches become `Exec` events; the caller decides whether to
    /// count them. Unattributable lines are reported but never counted.
    pub async fn fan_out(&mut self, command: &str, ignore_failures: bool) -> DispatchResult {
        let online = self.snapshot.online();
        let excluded = self.snapshot.not_online();
        let result = self
            .fanout
            .dispatch(command, &online, self.batch_size, &excluded, ignore_failures)
            .await;

        for failure in &result.failures {
            self.reporter.record(None, Severity::Exec, failure.reason.clone());
        }
        for diagnostic in &result.diagnostics {
            let severity = if diagnostic.dropped() {
                Severity::Exec
            } else {
                Severity::Warn
            };
            self.reporter.record(None, severity, diagnostic.to_string());
        }
        if !result.stderr.trim().is_empty() {
            self.reporter.record(
                None,
                Severity::Info,
                format!(
                    "Logging stderr output: BEGIN\n{}Logging stderr output: END",
                    result.stderr
                ),
            );
        }
        result
    }
}

/// The capability every check implements.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckOutcome>;
}

type Factory = fn() -> Box<dyn Check>;

/// Name to constructor mapping of every available check.
#[derive(Default)]
pub struct CheckRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in checks.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("filehandles", || Box::new(filehandles::FileHandleCheck));
        registry.register("memory", || Box::new(memory::MemoryCheck));
        registry.register("uptime", || Box::new(uptime::UptimeCheck));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: Factory) {
        self.factories.insert(name, factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Check>, ClusterCheckError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ClusterCheckError::UnknownCheck(name.to_string()))
    }

    /// `(name, description)` of every check, sorted by name.
    pub fn describe(&self) -> Vec<(&'static str, &'static str)> {
        self.factories
            .iter()
            .map(|(name, factory)| (*name, factory().description()))
            .collect()
    }
}

/// Checks to run on each cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSelection {
    pub interval: BTreeSet<String>,
    pub hourly: BTreeSet<String>,
}

impl CheckSelection {
    /// Resolve the selection from `--check`, `--set` and the hourly set.
    ///
    /// Explicit checks apply to both cadences. A named set applies to the
    /// interval cadence only; the hourly cadence then uses `hourly_set`
    /// (`all` for every registered check). Every name is validated against
    /// the registry before anything runs.
    pub fn resolve(
        registry: &CheckRegistry,
        checks: &ChecksConfig,
        explicit: Option<&[String]>,
        set: Option<&str>,
        hourly_set: &str,
    ) -> Result<Self, ClusterCheckError> {
        let all: BTreeSet<String> = registry.names().into_iter().map(String::from).collect();

        let validate = |names: &[String]| -> Result<BTreeSet<String>, ClusterCheckError> {
            names
                .iter()
                .map(|n| n.trim())
                .map(|n| {
                    if registry.contains(n) {
                        Ok(n.to_string())
                    } else {
                        Err(ClusterCheckError::UnknownCheck(n.to_string()))
                    }
                })
                .collect()
        };
        let named_set = |name: &str| -> Result<BTreeSet<String>, ClusterCheckError> {
            if name == "all" {
                return Ok(all.clone());
            }
            let members = checks
                .sets
                .get(name)
                .ok_or_else(|| ClusterCheckError::UnknownSet(name.to_string()))?;
            validate(members.as_slice())
        };

        if let Some(names) = explicit {
            let selected = validate(names)?;
            return Ok(Self {
                interval: selected.clone(),
                hourly: selected,
            });
        }
        if let Some(set) = set {
            return Ok(Self {
                interval: named_set(set)?,
                hourly: named_set(hourly_set)?,
            });
        }
        Ok(Self {
            interval: all.clone(),
            hourly: all,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fanout::executor::tests::FakeRemote;
    use crate::fanout::Demultiplexer;
    use crate::report::aggregator::tests::{reporter, snapshot};
    use crate::config::TrendConfig;
    use chrono::Local;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) fn fanout(remote: Arc<FakeRemote>) -> FanoutExecutor {
        FanoutExecutor::new(
            remote,
            Demultiplexer::new("tc", vec!["isi_rdo".to_string()]).unwrap(),
            Duration::from_secs(5),
        )
    }

    /// Owns everything a [`CheckContext`] borrows, over the three-node
    /// test snapshot.
    pub(crate) struct Harness {
        pub dir: TempDir,
        pub snapshot: ClusterSnapshot,
        pub fanout: FanoutExecutor,
        pub reporter: Reporter,
        pub stores: TrendStores,
        pub thresholds: ThresholdConfig,
        pub trend: TrendConfig,
        pub timestamp: i64,
    }

    impl Harness {
        pub(crate) fn new(remote: Arc<FakeRemote>) -> Self {
            let dir = TempDir::new().unwrap();
            let snapshot = snapshot();
            let mut reporter = reporter(dir.path());
            reporter.begin_cycle(&snapshot, Local::now()).unwrap();
            Self {
                stores: TrendStores::new(dir.path().to_path_buf()),
                dir,
                snapshot,
                fanout: fanout(remote),
                reporter,
                thresholds: ThresholdConfig::default(),
                trend: TrendConfig::default(),
                timestamp: 1_700_000_000,
            }
        }

        pub(crate) fn ctx(&mut self) -> CheckContext<'_> {
            CheckContext {
                snapshot: &self.snapshot,
                fanout: &self.fanout,
                reporter: &mut self.reporter,
                trend_stores: &mut self.stores,
                analyzer: TrendAnalyzer::from(&self.trend),
                thresholds: &self.thresholds,
                batch_size: 0,
                timestamp: self.timestamp,
            }
        }

        pub(crate) fn texts(&self, lnn: Lnn, severity: Severity) -> Vec<String> {
            self.reporter
                .ledger()
                .events(lnn, severity)
                .iter()
                .map(|e| e.text.clone())
                .collect()
        }
    }

    fn config_with_set() -> ChecksConfig {
        let mut checks = ChecksConfig::default();
        checks
            .sets
            .insert("quick".to_string(), vec!["uptime".to_string()]);
        checks
            .sets
            .insert("broken".to_string(), vec!["nosuch".to_string()]);
        checks
    }

    #[test]
    fn test_builtin_registry() {
        let registry = CheckRegistry::builtin();
        assert_eq!(registry.names(), vec!["filehandles", "memory", "uptime"]);
        assert_eq!(registry.create("uptime").unwrap().name(), "uptime");
        assert!(matches!(
            registry.create("nosuch"),
            Err(ClusterCheckError::UnknownCheck(_))
        ));
        assert!(registry.describe().iter().all(|(_, d)| !d.is_empty()));
    }

    #[test]
    fn test_selection_defaults_to_all() {
        let registry = CheckRegistry::builtin();
        let selection =
            CheckSelection::resolve(&registry, &ChecksConfig::default(), None, None, "all").unwrap();
        assert_eq!(selection.interval.len(), 3);
        assert_eq!(selection.interval, selection.hourly);
    }

    #[test]
    fn test_selection_explicit_checks() {
        let registry = CheckRegistry::builtin();
        let names = vec!["memory".to_string(), " uptime".to_string()];
        let selection =
            CheckSelection::resolve(&registry, &ChecksConfig::default(), Some(&names), None, "all").unwrap();
        assert_eq!(
            selection.hourly.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["memory", "uptime"]
        );

        let bad = vec!["nosuch".to_string()];
        let err = CheckSelection::resolve(&registry, &ChecksConfig::default(), Some(&bad), None, "all")
            .unwrap_err();
        assert!(matches!(err, ClusterCheckError::UnknownCheck(name) if name == "nosuch"));
    }

    #[test]
    fn test_selection_named_set() {
        let registry = CheckRegistry::builtin();
        let checks = config_with_set();
        let selection = CheckSelection::resolve(&registry, &checks, None, Some("quick"), "all").unwrap();
        assert_eq!(selection.interval.len(), 1);
        assert_eq!(selection.hourly.len(), 3);

        assert!(matches!(
            CheckSelection::resolve(&registry, &checks, None, Some("missing"), "all"),
            Err(ClusterCheckError::UnknownSet(_))
        ));
        assert!(matches!(
            CheckSelection::resolve(&registry, &checks, None, Some("broken"), "all"),
            Err(ClusterCheckError::UnknownCheck(_))
        ));
    }

    #[tokio::test]
    async fn test_fan_out_reports_problems() {
        let remote = Arc::new(FakeRemote::new(|_, _| crate::shell::CommandOutput {
            exit_code: Some(0),
            stdout: "tc-1: a tc-2: b\ngarbage\n".to_string(),
            stderr: "warning: slow\n".to_string(),
            timed_out: false,
        }));

        let mut harness = Harness::new(remote);
        let result = harness.ctx().fan_out("x", false).await;

        assert_eq!(result.output(Lnn(2)), "b\n");
        let events = harness.reporter.ledger().cluster_events();
        let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
        assert!(texts.iter().any(|t| t.starts_with("FOUND DOUBLED LINE")));
        assert!(texts.iter().any(|t| t.starts_with("UNMATCHED LINE: ->garbage<-")));
        assert!(texts
            .iter()
            .any(|t| t.starts_with("Logging stderr output: BEGIN\nwarning: slow\n")));
        assert_eq!(result.execution_errors(), 0);
    }
}
