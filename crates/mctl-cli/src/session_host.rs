//! Reloads a mission's process inside the tmux pane it already occupies.

use mctl_core::Mission;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

const REMAIN_ON_EXIT: &str = "remain-on-exit";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("mission {id} is not bound to a tmux pane")]
    NotBound { id: String },
    #[error("pane %{pane} for mission {id} no longer exists; run `mctl resume {id}` to reopen it in a new window")]
    PaneGone { id: String, pane: u64 },
    #[error("tmux not found on PATH; install tmux or run `mctl resume <id>` in a terminal")]
    MultiplexerMissing,
    #[error("`tmux {command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("tmux io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to stop mission {id}: {message}")]
    Stop { id: String, message: String },
}

/// The handful of multiplexer operations an in-place reload needs.
pub trait Multiplexer {
    /// The window holding `pane`, or `None` when the pane is gone.
    fn pane_window(&self, pane: &str) -> Result<Option<String>, HostError>;

    /// `None` when the option is not set on the window itself.
    fn window_option(&self, window: &str, name: &str) -> Result<Option<String>, HostError>;

    /// `None` unsets the window-level value.
    fn set_window_option(
        &self,
        window: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), HostError>;

    /// Kills whatever runs in `pane` and starts `command` in its place.
    fn respawn_pane(&self, pane: &str, cwd: &Path, command: &[String]) -> Result<(), HostError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    fn run(&self, args: &[&str]) -> Result<std::process::Output, HostError> {
        Command::new("tmux").args(args).output().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                HostError::MultiplexerMissing
            } else {
                HostError::Io(err)
            }
        })
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, HostError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(HostError::Command {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Multiplexer for TmuxMultiplexer {
    fn pane_window(&self, pane: &str) -> Result<Option<String>, HostError> {
        let output = self.run(&["display-message", "-p", "-t", pane, "#{window_id}"])?;
        if !output.status.success() {
            debug!(
                event = "tmux_pane_missing",
                pane,
                stderr = %String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }
        let window = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!window.is_empty()).then_some(window))
    }

    fn window_option(&self, window: &str, name: &str) -> Result<Option<String>, HostError> {
        let value = self.run_checked(&["show-options", "-w", "-v", "-t", window, name])?;
        Ok((!value.is_empty()).then_some(value))
    }

    fn set_window_option(
        &self,
        window: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), HostError> {
        match value {
            Some(value) => self.run_checked(&["set-option", "-w", "-t", window, name, value])?,
            None => self.run_checked(&["set-option", "-w", "-u", "-t", window, name])?,
        };
        Ok(())
    }

    fn respawn_pane(&self, pane: &str, cwd: &Path, command: &[String]) -> Result<(), HostError> {
        let cwd = cwd.to_string_lossy();
        let mut args = vec!["respawn-pane", "-k", "-t", pane, "-c", cwd.as_ref()];
        args.extend(command.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }
}

/// Holds `remain-on-exit` on for a window and puts the previous value back
/// when dropped, whichever way the reload ends.
pub struct KeepAliveGuard<'a, M: Multiplexer + ?Sized> {
    mux: &'a M,
    window: String,
    prior: Option<String>,
}

impl<'a, M: Multiplexer + ?Sized> KeepAliveGuard<'a, M> {
    pub fn engage(mux: &'a M, window: &str) -> Result<Self, HostError> {
        let prior = mux.window_option(window, REMAIN_ON_EXIT)?;
        mux.set_window_option(window, REMAIN_ON_EXIT, Some("on"))?;
        Ok(Self {
            mux,
            window: window.to_string(),
            prior,
        })
    }
}

impl<M: Multiplexer + ?Sized> Drop for KeepAliveGuard<'_, M> {
    fn drop(&mut self) {
        if let Err(err) =
            self.mux
                .set_window_option(&self.window, REMAIN_ON_EXIT, self.prior.as_deref())
        {
            warn!(event = "tmux_keepalive_restore_error", window = %self.window, error = %err);
        }
    }
}

pub fn pane_target(pane: u64) -> String {
    format!("%{pane}")
}

/// Parses `TMUX_PANE` (`%12`) into the stored numeric handle.
pub fn parse_pane(raw: &str) -> Option<u64> {
    raw.trim().trim_start_matches('%').parse().ok()
}

/// Stops the mission and respawns `resume` in the pane it is bound to. The
/// pane keeps its place in the layout.
pub async fn reload_in_place<M, F, Fut, E>(
    mux: &M,
    mission: &Mission,
    resume: &[String],
    stop: F,
) -> Result<(), HostError>
where
    M: Multiplexer + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let id = mission.short_id().to_string();
    let pane = mission
        .pane_id
        .ok_or_else(|| HostError::NotBound { id: id.clone() })?;
    let target = pane_target(pane);
    let window = mux
        .pane_window(&target)?
        .ok_or_else(|| HostError::PaneGone {
            id: id.clone(),
            pane,
        })?;

    let _keep_alive = KeepAliveGuard::engage(mux, &window)?;
    stop().await.map_err(|err| HostError::Stop {
        id: id.clone(),
        message: err.to_string(),
    })?;
    mux.respawn_pane(&target, &mission.workspace, resume)?;
    info!(event = "mission_reloaded", id = %mission.id, pane = %target, window = %window);
    Ok(())
}
