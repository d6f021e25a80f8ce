//! Single-instance pid marker.

use crate::error::ClusterCheckError;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Whether a process with this pid exists. A process owned by another
/// user still counts.
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The pid stored in a marker file, if it holds one.
pub fn read_pid(path: &Path) -> std::io::Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// The pid of a live process other than this one that owns the marker.
pub fn live_owner(path: &Path) -> Option<i32> {
    let own_pid = std::process::id() as i32;
    read_pid(path)
        .ok()
        .flatten()
        .filter(|pid| *pid != own_pid && is_process_running(*pid))
}

/// Held for the life of a run; dropping it removes the marker.
#[derive(Debug)]
pub struct PidMarker {
    path: PathBuf,
    pid: i32,
}

impl PidMarker {
    /// Claim the marker at `path` for this process.
    ///
    /// A marker naming a live process is left untouched and refused. A
    /// stale or unreadable marker is removed first.
    pub fn acquire(path: &Path) -> Result<Self, ClusterCheckError> {
        let own_pid = std::process::id() as i32;
        let io_error = |source: std::io::Error| ClusterCheckError::Destination {
            what: "pid marker",
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            match read_pid(path).map_err(io_error)? {
                Some(pid) if pid != own_pid && is_process_running(pid) => {
                    return Err(ClusterCheckError::AlreadyRunning {
                        pid,
                        path: path.to_path_buf(),
                    });
                }
                Some(pid) => {
                    info!("Deleting stale pid file {} (pid {})", path.display(), pid);
                    fs::remove_file(path).map_err(io_error)?;
                }
                None => {
                    info!("Deleting invalid pid file {}", path.display());
                    fs::remove_file(path).map_err(io_error)?;
                }
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, format!("{}\n", own_pid)).map_err(io_error)?;
        debug!("Wrote pid {} to {}", own_pid, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            pid: own_pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for PidMarker {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed pid file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("pid file {} missing", self.path.display());
            }
            Err(e) => warn!(
                "Failed to remove pid file {}, please remove manually: {}",
                self.path.display(),
                e
            ),
        }
    }
}
