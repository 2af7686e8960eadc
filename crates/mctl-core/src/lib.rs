use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

pub mod instance;
pub mod ipc;
pub mod pidfile;
pub mod resolve;

pub const SHORT_ID_LEN: usize = 8;

/// Status as persisted in the registry. Liveness is never stored.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StoredStatus {
    #[default]
    Active,
    Archived,
}

impl StoredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoredStatus::Active => "active",
            StoredStatus::Archived => "archived",
        }
    }

    pub fn is_archived(&self) -> bool {
        matches!(self, StoredStatus::Archived)
    }
}

impl fmt::Display for StoredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoredStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(StoredStatus::Active),
            "archived" => Ok(StoredStatus::Archived),
            other => Err(format!("Unknown mission status: {other}")),
        }
    }
}

/// Lifecycle state reported to clients, derived at query time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MissionState {
    Running,
    Stopped,
    Archived,
}

impl MissionState {
    /// Archived missions short-circuit before `process_alive` is consulted, so a
    /// recycled PID can never make an archived mission look alive.
    pub fn derive(stored: StoredStatus, process_alive: impl FnOnce() -> bool) -> Self {
        match stored {
            StoredStatus::Archived => MissionState::Archived,
            StoredStatus::Active => {
                if process_alive() {
                    MissionState::Running
                } else {
                    MissionState::Stopped
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MissionState::Running => "running",
            MissionState::Stopped => "stopped",
            MissionState::Archived => "archived",
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mission {
    pub id: String,
    #[serde(default)]
    pub status: StoredStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub workspace: PathBuf,
    #[serde(default)]
    pub pane_id: Option<u64>,
    #[serde(default)]
    pub cron_job: Option<String>,
    #[serde(default)]
    pub config_snapshot: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Mission {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.short_id())
    }
}

/// A mission record together with its derived lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionView {
    #[serde(flatten)]
    pub mission: Mission,
    pub state: MissionState,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl MissionView {
    pub fn is_running(&self) -> bool {
        self.state == MissionState::Running
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMission {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "cron")]
    pub cron_job: Option<String>,
    #[serde(default)]
    pub config_snapshot: Option<String>,
}

/// Partial update of the mutable mission fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config_snapshot: Option<String>,
}

impl MissionPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.config_snapshot.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionFilter {
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default, alias = "cron")]
    pub cron_job: Option<String>,
}

pub fn new_mission_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// Normalizes a user-typed id: lowercase, hyphens stripped.
pub fn normalize_mission_ref(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// True for a short id (8 hex), a simple uuid (32 hex) or a hyphenated uuid.
pub fn looks_like_mission_id(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.contains('-') {
        return trimmed.len() == 36 && Uuid::parse_str(trimmed).is_ok();
    }
    matches!(trimmed.len(), SHORT_ID_LEN | 32) && trimmed.chars().all(|c| c.is_ascii_hexdigit())
}
