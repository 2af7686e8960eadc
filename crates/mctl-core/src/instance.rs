use crate::pidfile::{StopPolicy, STOP_TICK};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const HOME_ENV: &str = "MCTL_HOME";
pub const LOG_ENV: &str = "MCTL_LOG";
pub const SESSION_ENV: &str = "MCTL_SESSION";
pub const SERVER_MARKER_ENV: &str = "MCTL_SERVER_PROCESS";

const DEFAULT_AGENT_COMMAND: &str = "claude --continue";
const DEFAULT_PICKER: &str = "fzf";

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("cannot locate a home directory; set MCTL_HOME")]
    NoHome,
    #[error("failed to prepare {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// One mission-control instance, addressed by its root directory. Every path a
/// component touches is derived from here, so two roots never share a PID
/// file, socket or registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    root: PathBuf,
}

impl Instance {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self, InstanceError> {
        if let Ok(value) = std::env::var(HOME_ENV) {
            if !value.trim().is_empty() {
                return Ok(Self::new(value.trim()));
            }
        }
        dirs::home_dir()
            .map(|home| Self::new(home.join(".mctl")))
            .ok_or(InstanceError::NoHome)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn server_pid_path(&self) -> PathBuf {
        self.run_dir().join("server.pid")
    }

    pub fn server_lock_path(&self) -> PathBuf {
        self.run_dir().join("server.lock")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.run_dir().join("control.sock")
    }

    /// Where releases before the `run/` layout kept the server PID.
    pub fn legacy_server_pid_path(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn missions_dir(&self) -> PathBuf {
        self.root.join("missions")
    }

    pub fn mission_dir(&self, id: &str) -> PathBuf {
        self.missions_dir().join(id)
    }

    pub fn mission_pid_path(&self, id: &str) -> PathBuf {
        self.mission_dir(id).join("wrapper.pid")
    }

    pub fn mission_workspace(&self, id: &str) -> PathBuf {
        self.mission_dir(id).join("workspace")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn ensure_dirs(&self) -> Result<(), InstanceError> {
        for dir in [
            self.root.clone(),
            self.run_dir(),
            self.log_dir(),
            self.missions_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| InstanceError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(self.run_dir(), fs::Permissions::from_mode(0o700));
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings::load(&self.config_path())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub agent_command: String,
    pub picker: String,
    pub log_level: String,
    pub stop_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
            picker: DEFAULT_PICKER.to_string(),
            log_level: "info".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl Settings {
    /// Missing or unparsable files fall back to defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&contents) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(event = "settings_parse_error", path = %path.display(), error = %err);
                Self::default()
            }
        }
    }

    pub fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            tick: STOP_TICK,
            deadline: Duration::from_secs(self.stop_timeout_secs.max(1)),
        }
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

pub fn in_managed_session() -> bool {
    env_true(SESSION_ENV)
}

pub fn running_as_server() -> bool {
    env_true(SERVER_MARKER_ENV)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_are_scoped_to_the_root() {
        let a = Instance::new("/tmp/mctl-a");
        let b = Instance::new("/tmp/mctl-b");
        assert_ne!(a.socket_path(), b.socket_path());
        assert_ne!(a.server_pid_path(), b.server_pid_path());
        assert_eq!(
            a.mission_pid_path("abc"),
            PathBuf::from("/tmp/mctl-a/missions/abc/wrapper.pid")
        );
        assert!(a.socket_path().starts_with(a.run_dir()));
    }

    #[test]
    fn settings_fill_missing_keys_with_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "picker = \"sk\"\nstop_timeout_secs = 3\n").expect("write");
        let settings = Settings::load(&path);
        assert_eq!(settings.picker, "sk");
        assert_eq!(settings.stop_timeout_secs, 3);
        assert_eq!(settings.agent_command, DEFAULT_AGENT_COMMAND);
        assert_eq!(settings.stop_policy().deadline, Duration::from_secs(3));
    }

    #[test]
    fn unparsable_settings_yield_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "picker = [").expect("write");
        assert_eq!(Settings::load(&path), Settings::default());
        assert_eq!(Settings::load(&dir.path().join("missing.toml")), Settings::default());
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let dir = TempDir::new().expect("tempdir");
        let instance = Instance::new(dir.path().join("home"));
        instance.ensure_dirs().expect("ensure dirs");
        assert!(instance.run_dir().is_dir());
        assert!(instance.missions_dir().is_dir());
        assert!(instance.log_dir().is_dir());
    }
}
