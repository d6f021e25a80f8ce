//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.clustercheck.toml` files. Every section has defaults, so an empty
//! file (or no file at all) yields a working configuration.

use crate::error::ClusterCheckError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".clustercheck.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Cluster discovery commands.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Fan-out executor settings.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Leak detection settings.
    #[serde(default)]
    pub trend: TrendConfig,

    /// Daemon cadence settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Report destinations.
    #[serde(default)]
    pub report: ReportConfig,

    /// Check sets and deferred policy.
    #[serde(default)]
    pub checks: ChecksConfig,

    /// Pass/fail bounds used by the built-in checks.
    #[serde(default)]
    pub thresholds: ThresholdConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory for logs, summaries and trend stores.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Single-instance pid marker.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Echo report events to the console. Defaults on for single-report
    /// runs and off for the daemon when unset.
    #[serde(default)]
    pub verbose: Option<bool>,

    /// Disable ANSI colors on the console.
    #[serde(default)]
    pub nocolor: bool,

    /// Restrict checks to the local node.
    #[serde(default)]
    pub single_node: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            pid_file: default_pid_file(),
            verbose: None,
            nocolor: false,
            single_node: false,
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/ifs/data/Isilon_Support/cc_logs")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/clustercheck.pid")
}

/// Local commands used to discover the cluster each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Prints `<cluster>-<lnn>` for the local node.
    #[serde(default = "default_hostname_command")]
    pub hostname_command: String,

    /// Prints the kernel version banner (`uname -v` format).
    #[serde(default = "default_version_command")]
    pub version_command: String,

    /// Prints the hardware generation line.
    #[serde(default = "default_hardware_command")]
    pub hardware_command: String,

    /// Prints one `lnn id hostname ip` line per node.
    #[serde(default = "default_nodes_command")]
    pub nodes_command: String,

    /// Prints the set of up device ids, e.g. `{1,2,4-6}`.
    #[serde(default = "default_up_nodes_command")]
    pub up_nodes_command: String,

    /// Per-node status probe; `{lnn}` is replaced by the node number.
    #[serde(default = "default_status_command")]
    pub status_command: String,

    /// Timeout for each discovery command, in seconds.
    #[serde(default = "default_discovery_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hostname_command: default_hostname_command(),
            version_command: default_version_command(),
            hardware_command: default_hardware_command(),
            nodes_command: default_nodes_command(),
            up_nodes_command: default_up_nodes_command(),
            status_command: default_status_command(),
            timeout_seconds: default_discovery_timeout(),
        }
    }
}

impl ClusterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_hostname_command() -> String {
    "/sbin/sysctl -n kern.hostname".to_string()
}

fn default_version_command() -> String {
    "uname -v".to_string()
}

fn default_hardware_command() -> String {
    "/usr/bin/isi_hwtools/isi_hw_status | grep HWGen".to_string()
}

fn default_nodes_command() -> String {
    "isi_nodes %{lnn} %{id} %{name} %{ip_address}".to_string()
}

fn default_up_nodes_command() -> String {
    "/sbin/sysctl -n efs.gmp.up_nodes".to_string()
}

fn default_status_command() -> String {
    "isi status -n {lnn}".to_string()
}

fn default_discovery_timeout() -> u64 {
    300
}

/// Fan-out executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Remote-execution program, including its fixed arguments.
    #[serde(default = "default_fanout_program")]
    pub program: String,

    /// Flag introducing an explicit node list.
    #[serde(default = "default_include_flag")]
    pub include_flag: String,

    /// Flag introducing an exclusion list.
    #[serde(default = "default_exclude_flag")]
    pub exclude_flag: String,

    /// `nice` increment for remote batches; `None` disables it.
    #[serde(default = "default_nice")]
    pub nice: Option<i32>,

    /// Nodes per batch; 0 means one batch over all nodes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Hard wall-clock limit per batch, in seconds.
    #[serde(default = "default_fanout_timeout")]
    pub timeout_seconds: u64,

    /// Substrings that mark a line as carrying a foreign node name on
    /// purpose; such lines are never re-split.
    #[serde(default = "default_safe_substrings")]
    pub safe_substrings: Vec<String>,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            program: default_fanout_program(),
            include_flag: default_include_flag(),
            exclude_flag: default_exclude_flag(),
            nice: default_nice(),
            batch_size: default_batch_size(),
            timeout_seconds: default_fanout_timeout(),
            safe_substrings: default_safe_substrings(),
        }
    }
}

impl FanoutConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_fanout_program() -> String {
    "/usr/bin/isi_for_array -d \"\"".to_string()
}

fn default_include_flag() -> String {
    "-n".to_string()
}

fn default_exclude_flag() -> String {
    "-x".to_string()
}

fn default_nice() -> Option<i32> {
    Some(20)
}

fn default_batch_size() -> usize {
    24
}

fn default_fanout_timeout() -> u64 {
    3600
}

fn default_safe_substrings() -> Vec<String> {
    vec!["isi_rdo".to_string()]
}

/// Leak detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Minimum valid samples before a fit can classify a leak.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Most recent samples considered by a fit.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Minimum absolute slope for a leak.
    #[serde(default = "default_min_slope")]
    pub min_slope: f64,

    /// Minimum absolute correlation coefficient for a leak.
    #[serde(default = "default_min_correlation")]
    pub min_correlation: f64,

    /// Newest samples left out of the older window. Defaults to
    /// `min_samples` when unset.
    #[serde(default)]
    pub settle_samples: Option<usize>,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            max_samples: default_max_samples(),
            min_slope: default_min_slope(),
            min_correlation: default_min_correlation(),
            settle_samples: None,
        }
    }
}

fn default_min_samples() -> usize {
    20
}

fn default_max_samples() -> usize {
    288
}

fn default_min_slope() -> f64 {
    0.000001
}

fn default_min_correlation() -> f64 {
    0.95
}

/// Daemon cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Minutes between cycles.
    #[serde(default = "default_interval")]
    pub interval_minutes: u64,

    /// Minutes between hourly cycles.
    #[serde(default = "default_hourly")]
    pub hourly_minutes: u64,

    /// Check set for hourly cycles when `--set` picks the interval set.
    /// `all` selects every registered check.
    #[serde(default = "default_hourly_set")]
    pub hourly_set: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval(),
            hourly_minutes: default_hourly(),
            hourly_set: default_hourly_set(),
        }
    }
}

fn default_interval() -> u64 {
    15
}

fn default_hourly() -> u64 {
    60
}

fn default_hourly_set() -> String {
    "all".to_string()
}

/// Ordering of the sorted event section of the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Group by severity, then node (default).
    #[default]
    Totals,
    /// Group by node, then severity.
    Node,
    /// No sorted section.
    Off,
}

/// Markup of the mail body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MailFormat {
    #[default]
    Html,
    Plain,
}

/// Report destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Sorted section ordering.
    #[serde(default)]
    pub sort: SortOrder,

    /// Persistent log file name; defaults to `check_cluster_<ts>.html`.
    #[serde(default)]
    pub logfile: Option<String>,

    /// Directory receiving a mirror copy of every persistent log.
    #[serde(default)]
    pub remote_log_dir: Option<PathBuf>,

    /// Mail recipients; empty disables mail.
    #[serde(default)]
    pub mail_to: Vec<String>,

    /// Mail sender; defaults to the first recipient.
    #[serde(default)]
    pub mail_from: Option<String>,

    /// Mail body markup.
    #[serde(default)]
    pub mail_format: MailFormat,

    /// Summaries above this size are replaced by a pointer to the log.
    #[serde(default = "default_mail_size_limit")]
    pub mail_size_limit_kb: u64,

    /// `sendmail -t` compatible program used for delivery.
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            sort: SortOrder::default(),
            logfile: None,
            remote_log_dir: None,
            mail_to: Vec::new(),
            mail_from: None,
            mail_format: MailFormat::default(),
            mail_size_limit_kb: default_mail_size_limit(),
            sendmail: default_sendmail(),
        }
    }
}

fn default_mail_size_limit() -> u64 {
    100
}

fn default_sendmail() -> String {
    "/usr/sbin/sendmail".to_string()
}

/// Check sets and deferred policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Named sets of checks, selectable with `--set`.
    #[serde(default)]
    pub sets: BTreeMap<String, Vec<String>>,

    /// Checks whose errors are reported but never fail the run, with the
    /// justification. An empty justification does not defer.
    #[serde(default)]
    pub deferred: BTreeMap<String, String>,
}

impl ChecksConfig {
    /// The justification for deferring a check, if it is deferred.
    pub fn deferral(&self, check: &str) -> Option<&str> {
        self.deferred
            .get(check)
            .map(String::as_str)
            .filter(|reason| !reason.trim().is_empty())
    }
}

/// Bounds used by the built-in checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Highest acceptable 1-minute load average.
    #[serde(default = "default_max_load")]
    pub max_load: f64,

    /// Highest acceptable open/max file handle ratio.
    #[serde(default = "default_max_filehandle_ratio")]
    pub max_filehandle_ratio: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_load: default_max_load(),
            max_filehandle_ratio: default_max_filehandle_ratio(),
        }
    }
}

fn default_max_load() -> f64 {
    50.0
}

fn default_max_filehandle_ratio() -> f64 {
    0.9
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.log_dir {
            self.general.log_dir = dir.clone();
        }
        if let Some(ref pid_file) = args.pid_file {
            self.general.pid_file = pid_file.clone();
        }
        if args.verbose {
            self.general.verbose = Some(true);
        } else if args.noverbose {
            self.general.verbose = Some(false);
        }
        if args.nocolor {
            self.general.nocolor = true;
        }
        if args.single {
            self.general.single_node = true;
        }

        if let Some(batch) = args.batch {
            self.fanout.batch_size = batch;
        }

        // Trend thresholds
        if let Some(n) = args.min_samples {
            self.trend.min_samples = n;
        }
        if let Some(n) = args.max_samples {
            self.trend.max_samples = n;
        }
        if let Some(slope) = args.slope {
            self.trend.min_slope = slope;
        }
        if let Some(cc) = args.cc {
            self.trend.min_correlation = cc;
        }

        // Cadence
        if let Some(interval) = args.interval {
            self.schedule.interval_minutes = interval;
        }
        if let Some(hourly) = args.hourly {
            self.schedule.hourly_minutes = hourly;
        }

        // Report destinations
        if let Some(sort) = args.sort {
            self.report.sort = sort;
        }
        if let Some(ref logfile) = args.logfile {
            self.report.logfile = Some(logfile.clone());
        }
        if let Some(ref rld) = args.remote_log_dir {
            self.report.remote_log_dir = Some(rld.clone());
        }
        if let Some(ref mail) = args.mail {
            self.report.mail_to = mail.clone();
        }
        if let Some(ref from) = args.from {
            self.report.mail_from = Some(from.clone());
        }
    }

    /// Reject values the scheduler and analyzer cannot work with.
    pub fn validate(&self) -> Result<(), ClusterCheckError> {
        if self.schedule.interval_minutes == 0 {
            return Err(ClusterCheckError::InvalidConfig(
                "schedule.interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.schedule.hourly_minutes == 0 {
            return Err(ClusterCheckError::InvalidConfig(
                "schedule.hourly_minutes must be at least 1".to_string(),
            ));
        }
        if self.trend.max_samples < 2 {
            return Err(ClusterCheckError::InvalidConfig(
                "trend.max_samples must be at least 2".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.trend.min_correlation) {
            return Err(ClusterCheckError::InvalidConfig(
                "trend.min_correlation must be between 0 and 1".to_string(),
            ));
        }
        if self.fanout.timeout_seconds == 0 || self.cluster.timeout_seconds == 0 {
            return Err(ClusterCheckError::InvalidConfig(
                "command timeouts must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
