//! Errors that decide the process exit status.
//!
//! Everything else travels as `anyhow::Error`; these variants are the
//! conditions the entry point must tell apart when choosing an exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Exit code when checks found execution or threshold errors.
pub const EXIT_CHECK_ERRORS: i32 = 1;
/// Exit code for configuration errors (unknown check or set, bad flags).
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for runtime failures (destination I/O, cluster discovery).
pub const EXIT_RUNTIME: i32 = 3;
/// Exit code when another live instance owns the pid marker.
pub const EXIT_ALREADY_RUNNING: i32 = 4;

/// Fatal conditions with a dedicated exit code.
#[derive(Debug, Error)]
pub enum ClusterCheckError {
    #[error("check '{0}' does not exist")]
    UnknownCheck(String),

    #[error("check set '{0}' does not exist")]
    UnknownSet(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("found existing process {pid} owning {}", path.display())]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("failed to write {what} {}: {source}", path.display())]
    Destination {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cluster discovery failed: {0}")]
    Discovery(String),
}

impl ClusterCheckError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClusterCheckError::UnknownCheck(_)
            | ClusterCheckError::UnknownSet(_)
            | ClusterCheckError::InvalidConfig(_) => EXIT_CONFIG,
            ClusterCheckError::AlreadyRunning { .. } => EXIT_ALREADY_RUNNING,
            ClusterCheckError::Destination { .. } | ClusterCheckError::Discovery(_) => {
                EXIT_RUNTIME
            }
        }
    }
}

/// Exit code for an arbitrary error chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ClusterCheckError>())
        .map(ClusterCheckError::exit_code)
        .unwrap_or(EXIT_RUNTIME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            ClusterCheckError::UnknownCheck("x".into()).exit_code(),
            ClusterCheckError::AlreadyRunning {
                pid: 1,
                path: PathBuf::from("/tmp/x.pid"),
            }
            .exit_code(),
            ClusterCheckError::Discovery("boom".into()).exit_code(),
        ];
        assert_eq!(codes, [EXIT_CONFIG, EXIT_ALREADY_RUNNING, EXIT_RUNTIME]);
        assert!(codes.iter().all(|c| *c != EXIT_OK && *c != EXIT_CHECK_ERRORS));
    }

    #[test]
    fn test_exit_code_found_through_context() {
        let err = Err::<(), _>(ClusterCheckError::UnknownSet("nightly".into()))
            .context("selecting checks")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);

        let other = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&other), EXIT_RUNTIME);
    }
}
