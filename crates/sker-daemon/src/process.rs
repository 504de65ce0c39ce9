//! Process plumbing - PID file, liveness check, signal delivery

use crate::error::{DaemonError, Result};
use sker_core::config::GlobalWatchConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Files the daemon and its controller share
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
    pub stats_file: PathBuf,
}

impl DaemonPaths {
    /// Paths from the global config. Stats live next to the PID file.
    pub fn from_config(config: &GlobalWatchConfig) -> Self {
        let daemon = &config.daemon;
        let stats_file = daemon
            .pid_file
            .parent()
            .map(|dir| dir.join("stats.json"))
            .unwrap_or_else(|| PathBuf::from("stats.json"));

        Self {
            pid_file: daemon.pid_file.clone(),
            socket_path: daemon.socket_path.clone(),
            log_file: daemon.log_file.clone(),
            stats_file,
        }
    }

    /// All files inside one directory (tests, throwaway daemons)
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            pid_file: dir.join("daemon.pid"),
            socket_path: dir.join("daemon.sock"),
            log_file: dir.join("daemon.log"),
            stats_file: dir.join("stats.json"),
        }
    }
}

/// PID stored in the file, `None` when there is no file
pub async fn read_pid(path: &Path) -> Result<Option<u32>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DaemonError::io(path, e)),
    };

    content
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| DaemonError::InvalidPid {
            path: path.to_path_buf(),
            content: content.trim().to_string(),
        })
}

pub async fn write_pid(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DaemonError::io(parent, e))?;
    }
    tokio::fs::write(path, pid.to_string())
        .await
        .map_err(|e| DaemonError::io(path, e))?;
    debug!("Wrote pid {} to {:?}", pid, path);
    Ok(())
}

/// Remove a file if present
pub async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DaemonError::io(path, e)),
    }
}

/// Time the PID file was written, used as the daemon start time
pub async fn pid_file_written_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Does a process with this PID exist? Checks without delivering a signal.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs only the existence/permission check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // Exists but owned by someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

/// How to ask a process to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM, lets the daemon drain and clean up
    Terminate,
    /// SIGKILL, immediate
    Kill,
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| DaemonError::Signal {
        pid,
        source: std::io::Error::from(ErrorKind::InvalidInput),
    })?;
    if raw <= 0 {
        return Err(DaemonError::Signal {
            pid,
            source: std::io::Error::from(ErrorKind::InvalidInput),
        });
    }

    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };

    // SAFETY: plain kill(2) on a positive pid
    if unsafe { libc::kill(raw, sig) } != 0 {
        return Err(DaemonError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        });
    }

    info!("Sent {:?} to pid {}", signal, pid);
    Ok(())
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

    let killed = sys.process(target).map(|p| p.kill()).unwrap_or(false);
    if !killed {
        return Err(DaemonError::Signal {
            pid,
            source: std::io::Error::from(ErrorKind::NotFound),
        });
    }

    info!("Sent {:?} to pid {}", signal, pid);
    Ok(())
}

/// Poll until the process is gone. Returns false on timeout.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let step = Duration::from_millis(100);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
    }
}
