//! clustercheck - health monitoring for storage clusters
//!
//! Runs diagnostic checks across every node of a cluster, once or as a
//! daemon, tracks resource trends for leaks and writes severity-ranked
//! reports to the console, an HTML log and mail.
//!
//! Exit codes:
//!   0 - No execution or threshold errors
//!   1 - Checks found execution or threshold errors
//!   2 - Configuration error (bad flags, unknown check or set)
//!   3 - Runtime error (cluster discovery, report destination I/O)
//!   4 - Another instance is already running

mod checks;
mod cli;
mod cluster;
mod config;
mod error;
mod fanout;
mod models;
mod report;
mod scheduler;
mod shell;
mod trend;

use anyhow::{Context, Result};
use checks::{CheckRegistry, CheckSelection};
use cli::Args;
use cluster::ClusterProbe;
use config::{Config, DEFAULT_CONFIG_FILE};
use error::{exit_code_for, ClusterCheckError, EXIT_CHECK_ERRORS, EXIT_CONFIG, EXIT_OK, EXIT_RUNTIME};
use fanout::{ForArrayExecutor, RemoteExecutor};
use report::{CycleReport, Destinations, Mailer, ReportSettings, Reporter, SendmailMailer};
use scheduler::{pidfile, shutdown_signal, PidMarker, Scheduler};
use shell::{Shell, SystemShell};
use std::fs::{self, OpenOptions};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::FmtSubscriber;

fn main() {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        let code = match handle_init_config() {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                EXIT_RUNTIME
            }
        };
        std::process::exit(code);
    }

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("clustercheck failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

/// Handle --init-config: generate a default .clustercheck.toml.
fn handle_init_config() -> Result<i32> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!("{} already exists. Remove it first or edit it manually.", DEFAULT_CONFIG_FILE);
        return Ok(EXIT_CONFIG);
    }

    let content = Config::default_toml();
    fs::write(path, &content).with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize commands, check sets, thresholds and mail.");
    Ok(EXIT_OK)
}

/// Initialize tracing. Detached daemons log to a file since their
/// standard streams point at /dev/null.
fn init_logging(args: &Args, log_file: Option<&Path>) -> Result<()> {
    let level = args.log_level();
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open process log {}", path.display()))?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set tracing subscriber")?;
        }
    }
    Ok(())
}

/// Where the configuration came from, logged once tracing is up.
enum ConfigOrigin {
    Explicit(PathBuf),
    DefaultFile,
    BuiltIn,
    Fallback(String),
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigOrigin)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)
            .map_err(|e| ClusterCheckError::InvalidConfig(format!("{:#}", e)))?;
        return Ok((config, ConfigOrigin::Explicit(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigOrigin::DefaultFile)),
        Ok(None) => Ok((Config::default(), ConfigOrigin::BuiltIn)),
        Err(e) => Ok((Config::default(), ConfigOrigin::Fallback(format!("{:#}", e)))),
    }
}

/// Print registered checks, sets and the deferred policy (--show).
fn show_checks(registry: &CheckRegistry, config: &Config) {
    println!("The following individual checks are available:\n");
    for (name, description) in registry.describe() {
        println!("\t{:<14} {}", name, description);
    }

    if !config.checks.sets.is_empty() {
        println!("\nThe following sets of checks are available:\n");
        for (set, members) in &config.checks.sets {
            println!("\t{:<14} {}", set, members.join(", "));
        }
    }
    println!("\nHourly set: {}", config.schedule.hourly_set);

    let deferred: Vec<_> = config
        .checks
        .deferred
        .keys()
        .filter_map(|name| config.checks.deferral(name).map(|reason| (name, reason)))
        .collect();
    if !deferred.is_empty() {
        println!("\nDeferred checks (errors are reported but not counted):\n");
        for (name, reason) in deferred {
            println!("\t{:<14} {}", name, reason);
        }
    }
}

/// Resolve a path against the current directory before detaching, since
/// the daemon changes its working directory to `/`.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    Ok(cwd.join(path))
}

/// Run the complete workflow. Returns the exit code.
fn run(args: Args) -> Result<i32> {
    // Step 1: Configuration
    let (mut config, origin) = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    // Step 2: Check selection, validated before anything runs
    let registry = CheckRegistry::builtin();
    if args.show {
        show_checks(&registry, &config);
        return Ok(EXIT_OK);
    }
    let selection = CheckSelection::resolve(
        &registry,
        &config.checks,
        args.check.as_deref(),
        args.set.as_deref(),
        &config.schedule.hourly_set,
    )?;

    // Step 3: Refuse early if another instance is alive, then detach
    config.general.log_dir = absolute(&config.general.log_dir)?;
    config.general.pid_file = absolute(&config.general.pid_file)?;
    if let Some(ref dir) = config.report.remote_log_dir {
        config.report.remote_log_dir = Some(absolute(dir)?);
    }
    let summary_json = args.summary_json.as_deref().map(absolute).transpose()?;

    if let Some(pid) = pidfile::live_owner(&config.general.pid_file) {
        return Err(ClusterCheckError::AlreadyRunning {
            pid,
            path: config.general.pid_file.clone(),
        }
        .into());
    }

    let detach = args.monitor && !args.foreground;
    let process_log = if detach {
        fs::create_dir_all(&config.general.log_dir).with_context(|| {
            format!("Failed to create log directory: {}", config.general.log_dir.display())
        })?;
        nix::unistd::daemon(false, false).context("Failed to detach from the terminal")?;
        Some(config.general.log_dir.join("out.log"))
    } else {
        None
    };

    // Step 4: Logging
    init_logging(&args, process_log.as_deref())?;
    info!("clustercheck v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    match origin {
        ConfigOrigin::Explicit(path) => info!("Loaded config from: {}", path.display()),
        ConfigOrigin::DefaultFile => info!("Loaded default config from {}", DEFAULT_CONFIG_FILE),
        ConfigOrigin::BuiltIn => debug!("No config file found, using defaults"),
        ConfigOrigin::Fallback(e) => warn!("Failed to load config, using defaults: {}", e),
    }
    debug!("Interval checks: {:?}", selection.interval);
    debug!("Hourly checks: {:?}", selection.hourly);

    // Step 5: Single-instance marker, released on every exit path
    let marker = PidMarker::acquire(&config.general.pid_file)?;
    debug!("Holding {} as pid {}", marker.path().display(), marker.pid());

    // Step 6: Run
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let monitor = args.monitor;
    let report = runtime.block_on(run_checks(config, registry, selection, monitor))?;

    // Step 7: Results
    let Some(report) = report else {
        return Ok(EXIT_OK);
    };
    if let Some(path) = summary_json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize cycle summary")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }
    if !monitor && !args.quiet {
        println!("Results saved to {}", report.files.log.display());
    }

    if report.totals.is_failure() {
        Ok(EXIT_CHECK_ERRORS)
    } else {
        Ok(EXIT_OK)
    }
}

/// Wire the collaborators together and drive the scheduler.
async fn run_checks(
    config: Config,
    registry: CheckRegistry,
    selection: CheckSelection,
    monitor: bool,
) -> Result<Option<CycleReport>> {
    let shell: Arc<dyn Shell> = Arc::new(SystemShell);
    let probe = ClusterProbe::new(shell.clone(), config.cluster.clone(), config.general.single_node);
    let remote: Arc<dyn RemoteExecutor> = Arc::new(ForArrayExecutor::new(shell, config.fanout.clone()));

    // Quiet by default in daemon mode, verbose otherwise.
    let verbose = config.general.verbose.unwrap_or(!monitor);
    let color = !config.general.nocolor && std::io::stderr().is_terminal();
    let outputs = Destinations::stderr(verbose, color, config.report.mail_format);
    let mailer: Option<Arc<dyn Mailer>> = if config.report.mail_to.is_empty() {
        None
    } else {
        Some(Arc::new(SendmailMailer::new(config.report.sendmail.clone())))
    };
    let reporter = Reporter::new(ReportSettings::from_config(&config, !monitor), outputs, mailer);

    let shutdown = shutdown_signal()?;
    let mut scheduler = Scheduler::new(config, probe, remote, registry, selection, reporter);
    if monitor {
        scheduler.run_daemon(shutdown).await
    } else {
        scheduler.run_single(shutdown).await.map(Some)
    }
}
