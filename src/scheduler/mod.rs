//! Single-report and daemon cycle driver.
//!
//! A cycle discovers the cluster, reports node status, runs the selected
//! checks and finalizes the report. Single-report mode runs one cycle;
//! daemon mode repeats on the interval cadence until a shutdown signal
//! arrives between cycles.

pub mod cadence;
pub mod pidfile;

pub use cadence::{Cadence, CycleKind};
pub use pidfile::PidMarker;

use crate::checks::{CheckContext, CheckRegistry, CheckRunner, CheckSelection};
use crate::cluster::ClusterProbe;
use crate::config::Config;
use crate::error::ClusterCheckError;
use crate::fanout::{Demultiplexer, FanoutExecutor, RemoteExecutor};
use crate::models::{ClusterSnapshot, ErrorTotals, Severity};
use crate::report::{CycleReport, Reporter, TIMESTAMP_FORMAT};
use crate::trend::{TrendAnalyzer, TrendStores};
use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Resolves when SIGINT or SIGTERM arrives.
///
/// Handlers are installed immediately, so a signal that arrives before the
/// future is first polled is not lost.
pub fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    })
}

/// Owns everything that outlives a single cycle.
pub struct Scheduler {
    config: Config,
    probe: ClusterProbe,
    remote: Arc<dyn RemoteExecutor>,
    registry: CheckRegistry,
    selection: CheckSelection,
    reporter: Reporter,
    trend_stores: TrendStores,
}

impl Scheduler {
    pub fn new(
        config: Config,
        probe: ClusterProbe,
        remote: Arc<dyn RemoteExecutor>,
        registry: CheckRegistry,
        selection: CheckSelection,
        reporter: Reporter,
    ) -> Self {
        let trend_stores = TrendStores::new(config.general.log_dir.clone());
        Self {
            config,
            probe,
            remote,
            registry,
            selection,
            reporter,
            trend_stores,
        }
    }

    /// Batch size for fan-out. An exclusion-based batch would reach the
    /// whole cluster, so single-node runs always enumerate their node.
    fn batch_size(&self) -> usize {
        if self.config.general.single_node {
            self.config.fanout.batch_size.max(1)
        } else {
            self.config.fanout.batch_size
        }
    }

    /// Node status events at the start of a cycle. Offline nodes count as
    /// threshold errors.
    fn report_node_status(&mut self, snapshot: &ClusterSnapshot) -> ErrorTotals {
        let mut totals = ErrorTotals::default();
        for lnn in snapshot.offline() {
            self.reporter
                .record(Some(lnn), Severity::Fail, format!("Node offline: {}", lnn));
            totals.threshold_errors += 1;
        }
        for lnn in snapshot.unmounted() {
            self.reporter
                .record(Some(lnn), Severity::Warn, format!("Node unmounted: {}", lnn));
        }
        totals
    }

    /// Run one full cycle over `names`.
    pub async fn run_cycle(&mut self, names: &BTreeSet<String>, kind: Option<CycleKind>) -> Result<CycleReport> {
        let started = Local::now();
        let snapshot = self.probe.snapshot().await?;
        self.reporter.begin_cycle(&snapshot, started)?;

        let mut totals = self.report_node_status(&snapshot);
        let batch_size = self.batch_size();
        if let Some(kind) = kind {
            self.reporter.info(format!(
                "{} check at {} (batch={})...",
                kind,
                started.format(TIMESTAMP_FORMAT),
                batch_size
            ));
        }

        let demux = Demultiplexer::new(&snapshot.name, self.config.fanout.safe_substrings.clone())
            .with_context(|| format!("Invalid cluster name '{}'", snapshot.name))?;
        let fanout = FanoutExecutor::new(self.remote.clone(), demux, self.config.fanout.timeout());
        let runner = CheckRunner::new(&self.registry, &self.config.checks);

        {
            let mut ctx = CheckContext {
                snapshot: &snapshot,
                fanout: &fanout,
                reporter: &mut self.reporter,
                trend_stores: &mut self.trend_stores,
                analyzer: TrendAnalyzer::from(&self.config.trend),
                thresholds: &self.config.thresholds,
                batch_size,
                timestamp: started.timestamp(),
            };
            totals += runner.run(names, &mut ctx).await?;
        }
        self.reporter.checkpoint()?;

        if !self.config.report.mail_to.is_empty() {
            self.reporter.info(format!(
                "Sending report via email to \"{}\"",
                self.config.report.mail_to.join(",")
            ));
        }

        let report = self
            .reporter
            .finalize(&snapshot, totals, self.trend_stores.paths())
            .await?;
        info!(
            "Cycle finished: {} execution errors, {} threshold errors, {} leaks",
            totals.execution_errors, totals.threshold_errors, totals.leaks
        );
        Ok(report)
    }

    /// Run the interval selection once. A shutdown signal aborts the cycle.
    pub async fn run_single<F>(&mut self, shutdown: F) -> Result<CycleReport>
    where
        F: Future<Output = ()>,
    {
        let names = self.selection.interval.clone();
        tokio::select! {
            report = self.run_cycle(&names, None) => report,
            _ = shutdown => Err(anyhow!("interrupted before the report was complete")),
        }
    }

    /// Run cycles until `shutdown` resolves. Returns the report of the last
    /// completed cycle.
    ///
    /// A cycle in progress always completes; the signal is only acted on
    /// while sleeping. Discovery and destination failures skip the cycle.
    pub async fn run_daemon<F>(&mut self, shutdown: F) -> Result<Option<CycleReport>>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cadence = Cadence::new(
            self.config.schedule.interval_minutes,
            self.config.schedule.hourly_minutes,
            Local::now().timestamp(),
        );
        let mut last = None;
        let mut cycle: u64 = 1;

        loop {
            let kind = cadence.next(Local::now().timestamp());
            let names = match kind {
                CycleKind::Hourly => self.selection.hourly.clone(),
                CycleKind::Interval => self.selection.interval.clone(),
            };
            info!("Starting {} cycle {}", kind, cycle);
            debug!("Next hourly cycle due at {}", cadence.next_hourly());

            match self.run_cycle(&names, Some(kind)).await {
                Ok(report) => last = Some(report),
                Err(e) => match e.downcast_ref::<ClusterCheckError>() {
                    Some(
                        ClusterCheckError::UnknownCheck(_)
                        | ClusterCheckError::UnknownSet(_)
                        | ClusterCheckError::InvalidConfig(_),
                    ) => return Err(e),
                    _ => {
                        error!("Cycle {} skipped: {:#}", cycle, e);
                    }
                },
            }

            self.reporter.info(format!(
                "Sleeping for {} (after cycle {})...",
                cadence.sleep_text(),
                cycle
            ));
            tokio::select! {
                _ = tokio::time::sleep(cadence.sleep()) => {}
                _ = &mut shutdown => {
                    warn!("Shutting down after cycle {}", cycle);
                    return Ok(last);
                }
            }
            cycle += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::scripted_cluster;
    use crate::config::GeneralConfig;
    use crate::fanout::executor::tests::FakeRemote;
    use crate::models::Lnn;
    use crate::report::aggregator::tests::settings;
    use crate::report::Destinations;
    use crate::config::MailFormat;
    use std::fs;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir, fatal_io: bool, single_node: bool) -> (Scheduler, Arc<FakeRemote>) {
        let config = Config {
            general: GeneralConfig {
                log_dir: dir.path().to_path_buf(),
                single_node,
                ..Default::default()
            },
            ..Default::default()
        };
        let remote = Arc::new(FakeRemote::per_node(
            "tc",
            vec![Lnn(1), Lnn(2), Lnn(3), Lnn(4)],
            |_, _| "up 1 day, load averages: 0.50, 0.40, 0.30".to_string(),
        ));
        let registry = CheckRegistry::builtin();
        let names = vec!["uptime".to_string()];
        let selection =
            CheckSelection::resolve(&registry, &config.checks, Some(&names), None, "all").unwrap();
        let reporter = Reporter::new(
            settings(dir.path(), fatal_io),
            Destinations::new(None, false, MailFormat::Html),
            None,
        );
        let probe = ClusterProbe::new(Arc::new(scripted_cluster()), config.cluster.clone(), single_node);
        (
            Scheduler::new(config, probe, remote.clone(), registry, selection, reporter),
            remote,
        )
    }

    #[tokio::test]
    async fn test_single_cycle() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, remote) = scheduler(&dir, true, false);

        let report = scheduler
            .run_single(futures::future::pending::<()>())
            .await
            .unwrap();

        // Node 3 is offline; node 4 is unmounted and only warned about.
        assert_eq!(report.totals.threshold_errors, 1);
        assert_eq!(report.totals.execution_errors, 0);
        assert!(report.totals.is_failure());

        let calls = remote.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].1,
            crate::fanout::NodeTarget::Include(vec![Lnn(1), Lnn(2)])
        );

        let log = fs::read_to_string(&report.files.log).unwrap();
        assert!(log.contains("Node offline: 3"));
        assert!(log.contains("Node unmounted: 4"));
        assert!(log.contains("check 'uptime' found 0 execution errors, 0 threshold errors"));
        assert!(!log.contains("Hourly check at"));
    }

    #[tokio::test]
    async fn test_single_node_enumerates_local_node() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, remote) = scheduler(&dir, true, true);

        let report = scheduler
            .run_single(futures::future::pending::<()>())
            .await
            .unwrap();

        assert!(!report.totals.is_failure());
        let calls = remote.calls.lock().unwrap();
        assert_eq!(calls[0].1, crate::fanout::NodeTarget::Include(vec![Lnn(1)]));
    }

    #[tokio::test]
    async fn test_daemon_stops_between_cycles() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, remote) = scheduler(&dir, false, false);

        let last = scheduler
            .run_daemon(futures::future::ready(()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(remote.calls.lock().unwrap().len(), 1);
        let log = fs::read_to_string(&last.files.log).unwrap();
        assert!(log.contains("Hourly check at"));
        assert!(log.contains("(batch=24)"));
    }

    #[tokio::test]
    async fn test_daemon_cycles_leave_no_per_cycle_files() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, _) = scheduler(&dir, false, false);

        for _ in 0..2 {
            scheduler
                .run_daemon(futures::future::ready(()))
                .await
                .unwrap()
                .unwrap();
        }

        let leftover: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".summary") || name.ends_with(".tmp"))
            .collect();
        assert!(leftover.is_empty(), "leftover files: {:?}", leftover);
    }

    #[tokio::test]
    async fn test_daemon_skips_failed_discovery() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, remote) = scheduler(&dir, false, false);
        scheduler.probe = ClusterProbe::new(
            Arc::new(crate::cluster::tests::ScriptedShell::default()),
            Default::default(),
            false,
        );

        let last = scheduler.run_daemon(futures::future::ready(())).await.unwrap();

        assert!(last.is_none());
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_discovery_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut scheduler, _) = scheduler(&dir, true, false);
        scheduler.probe = ClusterProbe::new(
            Arc::new(crate::cluster::tests::ScriptedShell::default()),
            Default::default(),
            false,
        );

        let err = scheduler
            .run_single(futures::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), crate::error::EXIT_RUNTIME);
    }
}
