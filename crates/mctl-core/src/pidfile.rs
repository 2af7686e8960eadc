use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const STOP_TICK: Duration = Duration::from_millis(100);
pub const STOP_DEADLINE: Duration = Duration::from_secs(10);
const KILL_CONFIRM_TICKS: u32 = 50;

#[derive(Debug, Error)]
pub enum PidError {
    #[error("failed to write pid file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: io::Error },
    #[error("pid {pid} survived SIGKILL")]
    Unkillable { pid: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running; any stale record was removed.
    NotRunning,
    Terminated,
    Killed,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOutcome::NotRunning => "not running",
            StopOutcome::Terminated => "terminated",
            StopOutcome::Killed => "killed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub tick: Duration,
    pub deadline: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            tick: STOP_TICK,
            deadline: STOP_DEADLINE,
        }
    }
}

/// Absent, empty or unparsable files all read as "no process".
pub fn read_pid(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

pub fn write_pid(path: &Path, pid: u32) -> Result<(), PidError> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("pid.tmp");
        fs::write(&tmp_path, pid.to_string())?;
        fs::rename(&tmp_path, path)
    };
    write().map_err(|source| PidError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn remove_pid(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(event = "pid_file_removed", path = %path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(event = "pid_file_remove_error", path = %path.display(), error = %err),
    }
}

/// Reads the record and verifies the OS process. A stale or garbage record is
/// deleted on the spot.
pub fn live_pid(path: &Path) -> Option<u32> {
    match read_pid(path) {
        Some(pid) if process_alive(pid) => Some(pid),
        Some(pid) => {
            debug!(event = "pid_file_stale", path = %path.display(), pid);
            remove_pid(path);
            None
        }
        None => {
            if path.exists() {
                remove_pid(path);
            }
            None
        }
    }
}

pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let stat_path = PathBuf::from("/proc").join(pid.to_string()).join("stat");
    let Ok(stat) = fs::read_to_string(stat_path) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// `Ok(false)` when the process is already gone.
pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<bool, PidError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| PidError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: plain kill(2) on a pid we read from our own record.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(PidError::Signal { pid, source: err })
}

/// Graceful-then-forceful stop of the process recorded at `path`.
///
/// Idempotent: a missing or stale record yields `NotRunning`. The record is
/// removed once death is confirmed.
pub async fn stop_process(path: &Path, policy: StopPolicy) -> Result<StopOutcome, PidError> {
    let Some(pid) = live_pid(path) else {
        return Ok(StopOutcome::NotRunning);
    };

    info!(event = "stop_sigterm", pid, path = %path.display());
    if !send_signal(pid, libc::SIGTERM)? {
        remove_pid(path);
        return Ok(StopOutcome::Terminated);
    }

    let started = Instant::now();
    loop {
        if !process_alive(pid) {
            remove_pid(path);
            return Ok(StopOutcome::Terminated);
        }
        if started.elapsed() >= policy.deadline {
            break;
        }
        tokio::time::sleep(policy.tick).await;
    }

    warn!(
        event = "stop_sigkill",
        pid,
        waited_ms = started.elapsed().as_millis() as u64
    );
    send_signal(pid, libc::SIGKILL)?;
    for _ in 0..KILL_CONFIRM_TICKS {
        if !process_alive(pid) {
            remove_pid(path);
            return Ok(StopOutcome::Killed);
        }
        tokio::time::sleep(policy.tick.min(Duration::from_millis(20))).await;
    }
    Err(PidError::Unkillable { pid })
}
