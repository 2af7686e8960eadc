use crate::client::{ClientError, ControlClient};
use crate::ops::MissionOps;
use crate::server::{self, ServerConfig, ServerError};
use mctl_core::instance::{
    running_as_server, Instance, InstanceError, HOME_ENV, SERVER_MARKER_ENV,
};
use mctl_core::ipc::HealthPayload;
use mctl_core::pidfile::{live_pid, stop_process, write_pid, PidError, StopOutcome, StopPolicy};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Pid(#[from] PidError),
    #[error("failed to spawn control server: {0}")]
    Spawn(io::Error),
    #[error("control server (pid {pid}) did not become ready within {timeout:?}; see {log}")]
    ReadyTimeout {
        pid: u32,
        timeout: Duration,
        log: PathBuf,
    },
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// A process to launch in its own session, detached from the caller's terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

/// Platform primitive: start `command` detached and report its PID. The
/// supervisor only needs the PID to persist.
pub trait Spawner {
    fn spawn_detached(&self, command: &DetachedCommand) -> io::Result<u32>;
}

impl<S: Spawner + ?Sized> Spawner for std::sync::Arc<S> {
    fn spawn_detached(&self, command: &DetachedCommand) -> io::Result<u32> {
        (**self).spawn_detached(command)
    }
}

/// Re-invokes the running binary with `setsid`, stdio detached.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentExeSpawner;

impl Spawner for CurrentExeSpawner {
    fn spawn_detached(&self, command: &DetachedCommand) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        let pid = child.id();
        // The server outlives us; a reaper thread keeps a short-lived failure
        // from lingering as a zombie while we poll for readiness.
        std::thread::spawn(move || {
            let mut child = child;
            let _ = child.wait();
        });
        Ok(pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning(u32),
    Started(u32),
    /// This process was the server; returned after it shut down.
    Served,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Running(HealthPayload),
    /// A live PID is recorded but the socket does not answer.
    Unresponsive(u32),
    NotRunning,
}

pub struct Supervisor<S: Spawner = CurrentExeSpawner> {
    instance: Instance,
    spawner: S,
    stop_policy: StopPolicy,
    ready_timeout: Duration,
    client_version: String,
    as_server: bool,
}

impl Supervisor<CurrentExeSpawner> {
    pub fn new(instance: Instance, stop_policy: StopPolicy) -> Self {
        Self::with_spawner(instance, stop_policy, CurrentExeSpawner)
    }
}

impl<S: Spawner> Supervisor<S> {
    pub fn with_spawner(instance: Instance, stop_policy: StopPolicy, spawner: S) -> Self {
        Self {
            instance,
            spawner,
            stop_policy,
            ready_timeout: READY_TIMEOUT,
            client_version: crate::VERSION.to_string(),
            as_server: running_as_server(),
        }
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    fn client(&self) -> ControlClient {
        ControlClient::new(self.instance.socket_path())
    }

    pub fn server_command(&self) -> io::Result<DetachedCommand> {
        Ok(DetachedCommand {
            program: std::env::current_exe()?,
            args: vec!["server".into(), "start".into()],
            env: vec![
                (SERVER_MARKER_ENV.into(), "1".into()),
                (HOME_ENV.into(), self.instance.root().as_os_str().to_owned()),
            ],
        })
    }

    pub async fn status(&self) -> ServerStatus {
        match self.client().health().await {
            Ok(health) => ServerStatus::Running(health),
            Err(_) => match live_pid(&self.instance.server_pid_path()) {
                Some(pid) => ServerStatus::Unresponsive(pid),
                None => ServerStatus::NotRunning,
            },
        }
    }

    /// In the server process this runs the server loop. Otherwise it spawns
    /// one unless a live server is already recorded.
    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        if self.as_server {
            let config = ServerConfig::new(self.instance.clone(), self.stop_policy);
            return match server::serve_until_signal(config).await {
                Ok(()) => Ok(StartOutcome::Served),
                Err(ServerError::AlreadyRunning(lock)) => {
                    debug!(event = "control_server_lock_lost", lock = %lock.display());
                    Ok(StartOutcome::Served)
                }
                Err(err) => Err(err.into()),
            };
        }

        self.stop_legacy().await;

        let pid_path = self.instance.server_pid_path();
        if let Some(pid) = live_pid(&pid_path) {
            return Ok(StartOutcome::AlreadyRunning(pid));
        }

        self.instance.ensure_dirs()?;
        let command = self.server_command().map_err(SupervisorError::Spawn)?;
        let child = self
            .spawner
            .spawn_detached(&command)
            .map_err(SupervisorError::Spawn)?;
        write_pid(&pid_path, child)?;
        info!(event = "control_server_spawned", pid = child);

        let health = self.wait_ready(child).await?;
        if health.pid != child {
            // A concurrent start won the lock; record the server that answered.
            debug!(
                event = "control_server_pid_rerecord",
                spawned = child,
                serving = health.pid
            );
            write_pid(&pid_path, health.pid)?;
        }
        Ok(StartOutcome::Started(health.pid))
    }

    async fn wait_ready(&self, pid: u32) -> Result<HealthPayload, SupervisorError> {
        let client = self.client();
        let started = Instant::now();
        loop {
            if let Ok(health) = client.health().await {
                if health.is_ok() {
                    return Ok(health);
                }
            }
            if started.elapsed() >= self.ready_timeout {
                return Err(SupervisorError::ReadyTimeout {
                    pid,
                    timeout: self.ready_timeout,
                    log: self.instance.log_dir().join("server.log"),
                });
            }
            tokio::time::sleep(READY_TICK).await;
        }
    }

    /// Best effort; never fails the caller.
    pub async fn ensure_running(&self) {
        if self.as_server {
            return;
        }
        if let Err(err) = self.start().await {
            debug!(event = "control_ensure_running_error", error = %err);
        }
    }

    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        self.stop_legacy().await;
        let outcome = stop_process(&self.instance.server_pid_path(), self.stop_policy).await?;
        info!(event = "control_server_stopped", outcome = outcome.as_str());
        Ok(outcome)
    }

    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        self.stop().await?;
        self.start().await
    }

    /// Old releases kept the server PID at the instance root.
    async fn stop_legacy(&self) {
        let legacy = self.instance.legacy_server_pid_path();
        if !legacy.exists() {
            return;
        }
        match stop_process(&legacy, self.stop_policy).await {
            Ok(outcome) => debug!(event = "legacy_server_stop", outcome = outcome.as_str()),
            Err(err) => warn!(event = "legacy_server_stop_error", error = %err),
        }
    }

    /// The running server's health when it answers with a different version.
    pub async fn detect_skew(&self) -> Option<HealthPayload> {
        match self.client().health().await {
            Ok(health) if health.is_ok() && health.version != self.client_version => Some(health),
            Ok(_) => None,
            Err(err) => {
                if !matches!(err, ClientError::Connect { .. }) {
                    debug!(event = "control_skew_probe_error", error = %err);
                }
                None
            }
        }
    }

    /// Restarts a server built from a different version. Swallows every failure.
    pub async fn refresh_if_skewed(&self) -> bool {
        let Some(health) = self.detect_skew().await else {
            return false;
        };
        eprintln!(
            "mctl: control server is {} but this binary is {}; restarting it",
            health.version, self.client_version
        );
        match self.restart().await {
            Ok(_) => true,
            Err(err) => {
                debug!(event = "control_skew_restart_error", error = %err);
                false
            }
        }
    }

    /// Stops the server and every wrapper, then deletes the registry, mission
    /// directories and run state. Configuration and templates survive.
    pub async fn reset(&self) -> Result<usize, SupervisorError> {
        self.stop().await?;
        let ops = MissionOps::new(self.instance.clone(), self.stop_policy);
        let stopped = ops.stop_all_wrappers().await;

        let registry = self.instance.registry_path();
        let mut targets = vec![
            registry.clone(),
            sidecar(&registry, "-wal"),
            sidecar(&registry, "-shm"),
        ];
        targets.push(self.instance.missions_dir());
        targets.push(self.instance.run_dir());
        for path in targets {
            remove_path(&path)?;
        }
        info!(event = "instance_reset", root = %self.instance.root().display(), stopped);
        Ok(stopped)
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn remove_path(path: &Path) -> Result<(), SupervisorError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
