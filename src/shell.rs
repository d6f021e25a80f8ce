//! Local command execution with a hard timeout.
//!
//! Every subprocess the tool starts (cluster discovery probes and the
//! remote-execution program used by fan-out) goes through the [`Shell`]
//! trait so tests can substitute canned output.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` when killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The command hit its wall-clock limit and was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Whether the command finished on its own with status 0.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs shell-style command strings.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Run `command` through a shell, killing it after `timeout`.
    ///
    /// A timeout is reported through [`CommandOutput::timed_out`], not as an
    /// error; `Err` means the command could not be started at all.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// `sh -c` on the local host.
#[derive(Debug, Clone, Default)]
pub struct SystemShell;

#[async_trait]
impl Shell for SystemShell {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("Executing: {} (timeout: {}s)", command, timeout.as_secs());

        let child = AsyncCommand::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", command))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.with_context(|| format!("Failed to collect output of: {}", command))?;
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            }
            Err(_) => {
                warn!("Command timed out after {}s: {}", timeout.as_secs(), command);
                Ok(CommandOutput {
                    exit_code: None,
                    timed_out: true,
                    ..CommandOutput::default()
                })
            }
        }
    }
}

/// Quote a string for inclusion in a `sh -c` command line.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_status() {
        let out = SystemShell
            .run("echo hello; echo oops >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let started = std::time::Instant::now();
        let out = SystemShell
            .run("sleep 30", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("uptime"), "'uptime'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_quoted_argument_survives_shell() {
        let command = format!("printf %s {}", quote("it's a $HOME"));
        let out = tokio_test::block_on(SystemShell.run(&command, Duration::from_secs(10))).unwrap();
        assert_eq!(out.stdout, "it's a $HOME");
        assert!(out.success());
    }
}
