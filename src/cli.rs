//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Flags that mirror configuration values are
//! optional so that the config file only gets overridden when a flag
//! was actually given.

use crate::config::SortOrder;
use clap::Parser;
use std::path::PathBuf;

/// clustercheck - health checks across every node of a storage cluster
///
/// Dispatches diagnostic commands to all nodes, attributes the combined
/// output back to each node, tracks resource trends for leaks and writes
/// a severity-ranked report to the console, an HTML log and mail.
///
/// Examples:
///   clustercheck
///   clustercheck --check memory,uptime --sort node
///   clustercheck --monitor --interval 15 --mail ops@example.com
///   clustercheck --show
///   clustercheck --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Checks to run (comma-separated)
    ///
    /// Applies to both interval and hourly cycles. Example: --check memory,uptime
    #[arg(short = 'k', long, value_name = "NAMES", value_delimiter = ',', conflicts_with = "set")]
    pub check: Option<Vec<String>>,

    /// Named check set from [checks.sets] for interval cycles
    #[arg(short, long, value_name = "NAME")]
    pub set: Option<String>,

    /// Run continuously as a daemon
    #[arg(short, long)]
    pub monitor: bool,

    /// With --monitor, stay attached to the terminal
    #[arg(long, requires = "monitor")]
    pub foreground: bool,

    /// Minutes between daemon cycles
    #[arg(short, long, value_name = "MINUTES")]
    pub interval: Option<u64>,

    /// Minutes between hourly daemon cycles
    #[arg(long, value_name = "MINUTES")]
    pub hourly: Option<u64>,

    /// Nodes per fan-out batch (0 runs one batch over all nodes)
    #[arg(short, long, value_name = "COUNT")]
    pub batch: Option<usize>,

    /// Minimum samples before a trend can be classified as a leak
    #[arg(long, value_name = "COUNT")]
    pub min_samples: Option<usize>,

    /// Most recent samples used by the trend fit
    #[arg(long, value_name = "COUNT")]
    pub max_samples: Option<usize>,

    /// Minimum absolute slope for a leak
    #[arg(long, value_name = "SLOPE")]
    pub slope: Option<f64>,

    /// Minimum absolute correlation coefficient for a leak
    #[arg(long, value_name = "COEFF")]
    pub cc: Option<f64>,

    /// Ordering of the sorted report section
    #[arg(long, value_name = "ORDER")]
    pub sort: Option<SortOrder>,

    /// Mail recipients (comma-separated)
    #[arg(long, value_name = "ADDRS", value_delimiter = ',', env = "CLUSTERCHECK_MAIL")]
    pub mail: Option<Vec<String>>,

    /// Mail sender (defaults to the first recipient)
    #[arg(long, value_name = "ADDR")]
    pub from: Option<String>,

    /// Directory for logs, summaries and trend stores
    #[arg(short, long, value_name = "DIR", env = "CLUSTERCHECK_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Directory that receives a copy of every report log
    #[arg(long, value_name = "DIR")]
    pub remote_log_dir: Option<PathBuf>,

    /// File name of the report log inside the log directory
    #[arg(long, value_name = "NAME")]
    pub logfile: Option<String>,

    /// Pid marker used for single-instance enforcement
    #[arg(long, value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    /// Only check the node this process runs on
    #[arg(long)]
    pub single: bool,

    /// List registered checks, sets and deferred checks, then exit
    #[arg(long)]
    pub show: bool,

    /// Echo report events to the console
    #[arg(short, long, conflicts_with = "noverbose")]
    pub verbose: bool,

    /// Do not echo report events to the console
    #[arg(long)]
    pub noverbose: bool,

    /// Disable ANSI colors on the console
    #[arg(long)]
    pub nocolor: bool,

    /// Only log process errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Enable debug logging of the process itself
    #[arg(short, long)]
    pub debug: bool,

    /// Path to configuration file
    ///
    /// If not specified, looks for .clustercheck.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Also write the run totals as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub summary_json: Option<PathBuf>,

    /// Generate a default .clustercheck.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.debug && self.quiet {
            return Err("Cannot use both --debug and --quiet".to_string());
        }

        if let Some(interval) = self.interval {
            if interval == 0 {
                return Err("Interval must be at least 1 minute".to_string());
            }
        }
        if let Some(hourly) = self.hourly {
            if hourly == 0 {
                return Err("Hourly period must be at least 1 minute".to_string());
            }
        }

        if let Some(cc) = self.cc {
            if !(0.0..=1.0).contains(&cc) {
                return Err("Correlation coefficient must be between 0.0 and 1.0".to_string());
            }
        }
        if let Some(slope) = self.slope {
            if slope < 0.0 {
                return Err("Slope must not be negative".to_string());
            }
        }

        if let (Some(min), Some(max)) = (self.min_samples, self.max_samples) {
            if min > max {
                return Err(format!(
                    "--min-samples ({}) cannot exceed --max-samples ({})",
                    min, max
                ));
            }
        }

        if let Some(ref checks) = self.check {
            if checks.iter().any(|c| c.trim().is_empty()) {
                return Err("--check contains an empty check name".to_string());
            }
        }

        if let Some(ref mail) = self.mail {
            if let Some(bad) = mail.iter().find(|addr| !addr.contains('@')) {
                return Err(format!("Invalid mail address: {}", bad));
            }
        }

        if let Some(ref logfile) = self.logfile {
            if logfile.contains('/') {
                return Err("--logfile is a file name, use --log-dir for the directory".to_string());
            }
        }

        if self.interval.is_some() && !self.monitor {
            return Err("--interval only applies with --monitor".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
