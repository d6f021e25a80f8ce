//! Cycle report aggregation.
//!
//! The [`Reporter`] owns the event ledger and the destinations of the
//! active cycle. Checks record events through it; at the end of a cycle it
//! renders the summary, writes the summary and log files, mails the
//! summary and mirrors the log.

use super::destinations::{Destination, Destinations};
use super::generator::{mail_subject, render_summary, SummaryContext};
use super::ledger::EventLedger;
use super::mail::{MailMessage, Mailer};
use super::TIMESTAMP_FORMAT;
use crate::config::{Config, MailFormat, SortOrder};
use crate::error::ClusterCheckError;
use crate::models::{ClusterSnapshot, ErrorTotals, Event, Lnn, Severity};
use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where and how a cycle's report is delivered.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub log_dir: PathBuf,
    pub logfile: Option<String>,
    pub remote_log_dir: Option<PathBuf>,
    pub mail_to: Vec<String>,
    pub mail_from: Option<String>,
    pub mail_format: MailFormat,
    pub mail_size_limit_kb: u64,
    pub sort: SortOrder,
    /// Destination I/O failures abort the run instead of being skipped.
    pub fatal_io: bool,
    /// Leave the summary file behind once the cycle is mailed.
    pub keep_summary: bool,
}

impl ReportSettings {
    /// Single-report runs keep their summary and stop on destination
    /// I/O failures; daemon cycles do neither.
    pub fn from_config(config: &Config, single_report: bool) -> Self {
        Self {
            log_dir: config.general.log_dir.clone(),
            logfile: config.report.logfile.clone(),
            remote_log_dir: config.report.remote_log_dir.clone(),
            mail_to: config.report.mail_to.clone(),
            mail_from: config.report.mail_from.clone(),
            mail_format: config.report.mail_format,
            mail_size_limit_kb: config.report.mail_size_limit_kb,
            sort: config.report.sort,
            fatal_io: single_report,
            keep_summary: single_report,
        }
    }
}

/// Files written for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleFiles {
    pub log: PathBuf,
    pub scratch: PathBuf,
    pub summary: PathBuf,
}

impl CycleFiles {
    fn new(settings: &ReportSettings, stamp: &str) -> Self {
        let base = format!("check_cluster_{}", stamp);
        let log_name = settings
            .logfile
            .clone()
            .unwrap_or_else(|| format!("{}.html", base));
        Self {
            log: settings.log_dir.join(log_name),
            scratch: settings.log_dir.join(format!("{}.tmp", base)),
            summary: settings.log_dir.join(format!("{}.summary", base)),
        }
    }
}

/// Outcome of a finished cycle, also written by `--summary-json`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cluster: String,
    pub started: DateTime<Local>,
    pub totals: ErrorTotals,
    /// Node-attributed event counts per severity tag.
    pub events: BTreeMap<String, usize>,
    pub files: CycleFiles,
    pub mailed: bool,
}

/// Ledger plus destinations of the active cycle.
pub struct Reporter {
    settings: ReportSettings,
    ledger: EventLedger,
    outputs: Destinations,
    mailer: Option<Arc<dyn Mailer>>,
    files: Option<CycleFiles>,
    cluster: String,
    started: DateTime<Local>,
}

impl Reporter {
    pub fn new(settings: ReportSettings, outputs: Destinations, mailer: Option<Arc<dyn Mailer>>) -> Self {
        Self {
            settings,
            ledger: EventLedger::new(),
            outputs,
            mailer,
            files: None,
            cluster: String::new(),
            started: Local::now(),
        }
    }

    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    pub fn files(&self) -> Option<&CycleFiles> {
        self.files.as_ref()
    }

    /// A destination write failed: fatal in single-report mode, skipped
    /// (with the destination closed) in daemon mode.
    fn io_failure(&mut self, dest: Destination, path: &Path, source: std::io::Error) -> Result<()> {
        if self.settings.fatal_io {
            return Err(ClusterCheckError::Destination {
                what: dest.name(),
                path: path.to_path_buf(),
                source,
            }
            .into());
        }
        warn!("Skipping {} {}: {}", dest, path.display(), source);
        self.outputs.close(dest);
        Ok(())
    }

    /// Reset the ledger and open the cycle's destinations.
    pub fn begin_cycle(&mut self, snapshot: &ClusterSnapshot, started: DateTime<Local>) -> Result<()> {
        self.ledger.reset(snapshot.nodes.keys().copied());
        self.cluster = snapshot.name.clone();
        self.started = started;

        let files = CycleFiles::new(&self.settings, &started.format(TIMESTAMP_FORMAT).to_string());
        debug!("Cycle log: {}", files.log.display());

        self.outputs.close(Destination::CycleSummary);
        self.outputs.close(Destination::MailBody);
        self.outputs.open(Destination::DetailLog);
        self.outputs.open(Destination::CycleScratch);

        if let Err(e) = fs::create_dir_all(&self.settings.log_dir) {
            let dir = self.settings.log_dir.clone();
            self.io_failure(Destination::DetailLog, &dir, e)?;
            self.outputs.close(Destination::CycleScratch);
        }
        self.files = Some(files);
        Ok(())
    }

    /// Record an event in the ledger and every open destination.
    pub fn record(&mut self, lnn: Option<Lnn>, severity: Severity, text: impl Into<String>) -> Event {
        let event = self.ledger.record(lnn, severity, text);
        self.outputs.write(event.lnn, event.severity, &event.text);
        event
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.record(None, Severity::Info, text);
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        self.record(None, Severity::Warn, text);
    }

    /// Persist the scratch buffer so a crash mid-cycle leaves the partial
    /// report behind.
    pub fn checkpoint(&mut self) -> Result<()> {
        let (Some(files), Some(content)) = (&self.files, self.outputs.content(Destination::CycleScratch)) else {
            return Ok(());
        };
        let path = files.scratch.clone();
        if let Err(e) = fs::write(&path, content) {
            self.io_failure(Destination::CycleScratch, &path, e)?;
        }
        Ok(())
    }

    /// Render the summary, write every file, send mail and close all
    /// destinations.
    pub async fn finalize(
        &mut self,
        snapshot: &ClusterSnapshot,
        totals: ErrorTotals,
        trend_files: Vec<PathBuf>,
    ) -> Result<CycleReport> {
        let files = match self.files.clone() {
            Some(files) => files,
            None => CycleFiles::new(&self.settings, &self.started.format(TIMESTAMP_FORMAT).to_string()),
        };
        let elapsed_minutes = (Local::now() - self.started).num_milliseconds() as f64 / 60_000.0;

        // The detail stays in the scratch buffer; the summary goes to the
        // log, the summary file and the mail body.
        let detail = self.outputs.close(Destination::CycleScratch).unwrap_or_default();
        self.outputs.open(Destination::CycleSummary);
        if !self.settings.mail_to.is_empty() && self.mailer.is_some() {
            self.outputs.open(Destination::MailBody);
        }

        let ctx = SummaryContext {
            snapshot,
            totals,
            log_file: files.log.clone(),
            trend_files,
            elapsed_minutes,
            sort: self.settings.sort,
        };
        for line in render_summary(&self.ledger, &ctx) {
            self.outputs.write(line.lnn, line.severity, &line.text);
        }
        self.outputs.append_raw(Destination::CycleSummary, &detail);

        let summary = self.outputs.close(Destination::CycleSummary).unwrap_or_default();
        if let Err(e) = fs::write(&files.summary, &summary) {
            self.io_failure(Destination::CycleSummary, &files.summary, e)?;
        }

        let mailed = self.send_mail(&files, &totals, summary.len()).await;

        self.write_log(&files)?;

        remove_scratch(&files.scratch);
        if !self.settings.keep_summary {
            remove_scratch(&files.summary);
        }
        self.outputs.flush_console();

        let events = self
            .ledger
            .severity_counts()
            .into_iter()
            .map(|(severity, count)| (severity.tag().to_string(), count))
            .collect();

        Ok(CycleReport {
            cluster: self.cluster.clone(),
            started: self.started,
            totals,
            events,
            files,
            mailed,
        })
    }

    /// Mail the summary. Failures become a warning event in the log.
    async fn send_mail(&mut self, files: &CycleFiles, totals: &ErrorTotals, summary_size: usize) -> bool {
        let Some(body) = self.outputs.close(Destination::MailBody) else {
            return false;
        };
        let Some(mailer) = self.mailer.clone() else {
            return false;
        };

        let to = self.settings.mail_to.clone();
        let from = self
            .settings
            .mail_from
            .clone()
            .unwrap_or_else(|| to.first().cloned().unwrap_or_default());
        let limit = self.settings.mail_size_limit_kb * 1024;
        let body = if summary_size as u64 > limit {
            format!(
                "This clustercheck report exceeded the recommended limit to be sent via email ({} kB). \
                 The report can be found on your cluster here: {}\n",
                self.settings.mail_size_limit_kb,
                files.log.display()
            )
        } else {
            body
        };

        let message = MailMessage {
            to: to.clone(),
            from: from.clone(),
            subject: mail_subject(totals, &self.cluster),
            body,
            html: self.settings.mail_format == MailFormat::Html,
        };
        match mailer.send(&message).await {
            Ok(()) => {
                info!("Mailed report to {}", to.join(","));
                self.info(format!("Email successfully sent to {} from {}.", to.join(","), from));
                true
            }
            Err(e) => {
                self.warn(format!("Unable to email results to {}: {:#}", to.join(","), e));
                false
            }
        }
    }

    /// Write the persistent log and its mirror copy.
    fn write_log(&mut self, files: &CycleFiles) -> Result<()> {
        let Some(body) = self.outputs.close(Destination::DetailLog) else {
            return Ok(());
        };
        let stamp = self.started.format(TIMESTAMP_FORMAT);
        let document = format!(
            "<html>\n<head><title>clustercheck {} {}</title></head>\n<body>\n{}</body></html>\n",
            self.cluster, stamp, body
        );
        if let Err(e) = fs::write(&files.log, &document) {
            return self.io_failure(Destination::DetailLog, &files.log, e);
        }

        if let Some(remote_dir) = self.settings.remote_log_dir.clone() {
            let Some(name) = files.log.file_name() else {
                return Ok(());
            };
            let mirror = remote_dir.join(name);
            let copied = fs::create_dir_all(&remote_dir).and_then(|_| fs::copy(&files.log, &mirror));
            if let Err(e) = copied {
                return self.io_failure(Destination::DetailLog, &mirror, e);
            }
            debug!("Mirrored log to {}", mirror.display());
        }
        Ok(())
    }
}

/// Delete a per-cycle file; a missing file is fine.
fn remove_scratch(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::report::destinations::tests::SharedSink;
    use crate::report::mail::tests::RecordingMailer;
    use crate::models::{Node, NodeStatus};
    use tempfile::TempDir;

    pub(crate) fn snapshot() -> ClusterSnapshot {
        let nodes = (1..=3)
            .map(|lnn| {
                (
                    Lnn(lnn),
                    Node {
                        lnn: Lnn(lnn),
                        id: lnn,
                        hostname: format!("tc-{}", lnn),
                        ip_address: format!("10.0.0.{}", lnn),
                        status: NodeStatus::Online,
                    },
                )
            })
            .collect();
        ClusterSnapshot {
            name: "tc".to_string(),
            software_version: "v9".to_string(),
            build: "B_9".to_string(),
            hardware: "HWGen: Gen6".to_string(),
            local_lnn: Lnn(1),
            nodes,
        }
    }

    pub(crate) fn settings(dir: &Path, single_report: bool) -> ReportSettings {
        ReportSettings::from_config(
            &Config {
                general: crate::config::GeneralConfig {
                    log_dir: dir.to_path_buf(),
                    ..Default::default()
                },
                ..Default::default()
            },
            single_report,
        )
    }

    pub(crate) fn reporter(dir: &Path) -> Reporter {
        Reporter::new(
            settings(dir, true),
            Destinations::new(None, false, MailFormat::Html),
            None,
        )
    }

    #[tokio::test]
    async fn test_cycle_writes_log_and_summary() {
        let dir = TempDir::new().unwrap();
        let mut reporter = reporter(dir.path());
        let snapshot = snapshot();

        reporter.begin_cycle(&snapshot, Local::now()).unwrap();
        reporter.record(Some(Lnn(2)), Severity::Fail, "load <high>");
        reporter.checkpoint().unwrap();
        let files = reporter.files().unwrap().clone();
        assert!(files.scratch.exists());

        let totals = ErrorTotals {
            execution_errors: 0,
            threshold_errors: 1,
            leaks: 0,
        };
        let report = reporter.finalize(&snapshot, totals, vec![]).await.unwrap();

        let log = fs::read_to_string(&report.files.log).unwrap();
        assert!(log.starts_with("<html>"));
        assert!(log.ends_with("</body></html>\n"));
        assert!(log.contains("load &lt;high&gt;"));
        assert!(log.contains("REPORT SUMMARY:"));

        let summary = fs::read_to_string(&report.files.summary).unwrap();
        let summary_at = summary.find("REPORT SUMMARY:").unwrap();
        let detail_at = summary.rfind("load &lt;high&gt;").unwrap();
        assert!(summary_at < detail_at);

        assert!(!files.scratch.exists());
        assert_eq!(report.events["FAIL"], 1);
        assert!(!report.mailed);
    }

    #[tokio::test]
    async fn test_daemon_cycle_removes_summary_after_mailing() {
        let dir = TempDir::new().unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let mut settings = settings(dir.path(), false);
        settings.mail_to = vec!["ops@example.com".to_string()];
        let mut reporter = Reporter::new(
            settings,
            Destinations::new(None, false, MailFormat::Html),
            Some(mailer.clone()),
        );
        let snapshot = snapshot();

        reporter.begin_cycle(&snapshot, Local::now()).unwrap();
        reporter.checkpoint().unwrap();
        let report = reporter
            .finalize(&snapshot, ErrorTotals::default(), vec![])
            .await
            .unwrap();

        assert!(report.mailed);
        assert!(mailer.sent.lock().unwrap()[0].body.contains("REPORT SUMMARY:"));
        assert!(report.files.log.exists());
        assert!(!report.files.summary.exists());
        assert!(!report.files.scratch.exists());
    }

    #[tokio::test]
    async fn test_mail_sent_with_subject() {
        let dir = TempDir::new().unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let mut settings = settings(dir.path(), true);
        settings.mail_to = vec!["ops@example.com".to_string()];
        let mut reporter = Reporter::new(
            settings,
            Destinations::new(None, false, MailFormat::Html),
            Some(mailer.clone()),
        );
        let snapshot = snapshot();

        reporter.begin_cycle(&snapshot, Local::now()).unwrap();
        let report = reporter
            .finalize(&snapshot, ErrorTotals::default(), vec![])
            .await
            .unwrap();

        assert!(report.mailed);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "ops@example.com");
        assert_eq!(
            sent[0].subject,
            "clustercheck: 0 error, 0 leak, 0 execution error (cluster tc)"
        );
        assert!(sent[0].body.contains("REPORT SUMMARY:"));
        let log = fs::read_to_string(&report.files.log).unwrap();
        assert!(log.contains("Email successfully sent to ops@example.com"));
    }

    #[tokio::test]
    async fn test_oversized_summary_mails_pointer() {
        let dir = TempDir::new().unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let mut settings = settings(dir.path(), true);
        settings.mail_to = vec!["ops@example.com".to_string()];
        settings.mail_size_limit_kb = 1;
        let mut reporter = Reporter::new(
            settings,
            Destinations::new(None, false, MailFormat::Html),
            Some(mailer.clone()),
        );
        let snapshot = snapshot();

        reporter.begin_cycle(&snapshot, Local::now()).unwrap();
        for i in 0..100 {
            reporter.record(Some(Lnn(1)), Severity::Warn, format!("warning number {}", i));
        }
        reporter
            .finalize(&snapshot, ErrorTotals::default(), vec![])
            .await
            .unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert!(sent[0].body.contains("exceeded the recommended limit"));
    }

    #[tokio::test]
    async fn test_mail_failure_is_warning() {
        let dir = TempDir::new().unwrap();
        let mailer = Arc::new(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        let mut settings = settings(dir.path(), true);
        settings.mail_to = vec!["ops@example.com".to_string()];
        let mut reporter = Reporter::new(
            settings,
            Destinations::new(None, false, MailFormat::Html),
            Some(mailer),
        );
        let snapshot = snapshot();

        reporter.begin_cycle(&snapshot, Local::now()).unwrap();
        let report = reporter
            .finalize(&snapshot, ErrorTotals::default(), vec![])
            .await
            .unwrap();

        assert!(!report.mailed);
        let warnings: Vec<_> = reporter
            .ledger()
            .cluster_events()
            .iter()
            .filter(|e| e.severity == Severity::Warn)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].text.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_remote_mirror() {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        let mut settings = settings(&dir.path().join("logs"), true);
        settings.remote_log_dir = Some(mirror.clone());
        settings.logfile = Some("fixed.html".to_string());
        let mut reporter = Reporter::new(settings, Destinations::new(None, false, MailFormat::Html), None);
        let snapshot = snapshot();

        reporter.begin_cycle(&snapshot, Local::now()).unwrap();
        let report = reporter
            .finalize(&snapshot, ErrorTotals::default(), vec![])
            .await
            .unwrap();

        assert!(report.files.log.ends_with("fixed.html"));
        assert!(mirror.join("fixed.html").exists());
    }

    #[tokio::test]
    async fn test_io_failure_fatal_only_when_configured() {
        let dir = TempDir::new().unwrap();
        // A file where the log directory should be.
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, "x").unwrap();
        let snapshot = snapshot();

        let mut fatal = Reporter::new(
            settings(&blocker, true),
            Destinations::new(None, false, MailFormat::Html),
            None,
        );
        let err = fatal.begin_cycle(&snapshot, Local::now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClusterCheckError>(),
            Some(ClusterCheckError::Destination { .. })
        ));

        let mut lenient = Reporter::new(
            settings(&blocker, false),
            Destinations::new(None, false, MailFormat::Html),
            None,
        );
        lenient.begin_cycle(&snapshot, Local::now()).unwrap();
        lenient.record(None, Severity::Info, "still running");
        lenient
            .finalize(&snapshot, ErrorTotals::default(), vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_console_receives_events_immediately() {
        let dir = TempDir::new().unwrap();
        let sink = SharedSink::default();
        let mut reporter = Reporter::new(
            settings(dir.path(), true),
            Destinations::new(Some(Box::new(sink.clone())), false, MailFormat::Html),
            None,
        );
        reporter.begin_cycle(&snapshot(), Local::now()).unwrap();
        reporter.record(Some(Lnn(3)), Severity::Pass, "fine");
        assert_eq!(sink.text(), "Node 3: PASS:  fine\n");
    }
}
