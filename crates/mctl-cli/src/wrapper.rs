use crate::session_host::parse_pane;
use anyhow::{bail, Context, Result};
use mctl_control::ControlHandle;
use mctl_core::instance::Instance;
use mctl_core::ipc::ErrorCode;
use mctl_core::pidfile::{live_pid, read_pid, remove_pid, send_signal, write_pid};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CHILD_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Run through `sh -c` inside the workspace.
    pub agent_command: String,
    pub heartbeat: Duration,
}

/// Runs the agent for one mission as its controlling process and returns the
/// agent's exit code.
pub async fn run(
    instance: &Instance,
    control: &ControlHandle,
    reference: &str,
    config: &WrapperConfig,
) -> Result<i32> {
    let view = control
        .get(reference)
        .await
        .with_context(|| format!("failed to look up mission {reference}"))?;
    let mission = view.mission;
    if mission.status.is_archived() {
        bail!(
            "mission {} is archived; start a new one with `mctl new`",
            mission.short_id()
        );
    }

    let pid_path = instance.mission_pid_path(&mission.id);
    let own_pid = std::process::id();
    if let Some(pid) = live_pid(&pid_path) {
        if pid != own_pid {
            bail!(
                "mission {} is already running (pid {pid}); use `mctl reload {}` to restart it",
                mission.short_id(),
                mission.short_id()
            );
        }
    }
    std::fs::create_dir_all(&mission.workspace)
        .with_context(|| format!("failed to create {}", mission.workspace.display()))?;
    write_pid(&pid_path, own_pid)?;

    let pane = std::env::var("TMUX_PANE")
        .ok()
        .and_then(|raw| parse_pane(&raw));
    if let Err(err) = control.bind(&mission.id, pane).await {
        if err.code() == Some(ErrorCode::Archived) {
            if read_pid(&pid_path) == Some(own_pid) {
                remove_pid(&pid_path);
            }
            bail!("mission {} was archived while starting", mission.short_id());
        }
        warn!(event = "wrapper_bind_error", id = %mission.id, error = %err);
    }
    info!(event = "wrapper_started", id = %mission.id, pid = own_pid, pane = ?pane);

    let (archived_tx, archived_rx) = oneshot::channel();
    let heartbeat = spawn_heartbeat(
        control.clone(),
        mission.id.clone(),
        config.heartbeat,
        archived_tx,
    );
    let result = supervise_agent(&config.agent_command, &mission.workspace, archived_rx).await;
    heartbeat.abort();

    if read_pid(&pid_path) == Some(own_pid) {
        remove_pid(&pid_path);
    }
    let status = result?;
    let code = status.code().unwrap_or(1);
    info!(event = "wrapper_exited", id = %mission.id, code);
    Ok(code)
}

/// Stamps a heartbeat every `every`. Fires `archived` and stops once the
/// registry reports the mission archived.
fn spawn_heartbeat(
    control: ControlHandle,
    id: String,
    every: Duration,
    archived: oneshot::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick is immediate and binding already stamped a heartbeat.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match control.heartbeat(&id).await {
                Ok(_) => {}
                Err(err) if err.code() == Some(ErrorCode::Archived) => {
                    info!(event = "wrapper_mission_archived", id = %id);
                    let _ = archived.send(());
                    return;
                }
                Err(err) => {
                    debug!(event = "wrapper_heartbeat_error", id = %id, error = %err);
                }
            }
        }
    })
}

async fn supervise_agent(
    command: &str,
    workspace: &std::path::Path,
    mut archived: oneshot::Receiver<()>,
) -> Result<ExitStatus> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to watch SIGHUP")?;
    // The agent shares the terminal and handles Ctrl-C itself.
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to watch SIGINT")?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .spawn()
        .with_context(|| format!("failed to start agent `{command}`"))?;

    let mut watching_archive = true;
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            fired = &mut archived, if watching_archive => {
                watching_archive = false;
                if fired.is_ok() {
                    return shutdown_child(&mut child, "archived").await;
                }
            }
            _ = interrupt.recv() => continue,
            _ = terminate.recv() => return shutdown_child(&mut child, "SIGTERM").await,
            _ = hangup.recv() => return shutdown_child(&mut child, "SIGHUP").await,
        }
    }
}

/// Passes the stop request on to the agent and escalates if it lingers.
async fn shutdown_child(child: &mut Child, reason: &str) -> Result<ExitStatus> {
    info!(event = "wrapper_shutdown", reason);
    if let Some(pid) = child.id() {
        if let Err(err) = send_signal(pid, libc::SIGTERM) {
            debug!(event = "wrapper_forward_signal_error", pid, error = %err);
        }
    }
    match tokio::time::timeout(CHILD_GRACE, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!(event = "wrapper_child_kill", grace_secs = CHILD_GRACE.as_secs());
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}
