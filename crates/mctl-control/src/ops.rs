use mctl_core::instance::Instance;
use mctl_core::ipc::{ErrorCode, ErrorPayload, StopReport};
use mctl_core::pidfile::{
    live_pid, remove_pid, stop_process, PidError, StopOutcome, StopPolicy,
};
use mctl_core::{
    new_mission_id, Mission, MissionFilter, MissionPatch, MissionState, MissionView, NewMission,
};
use mctl_storage::{MissionStore, StorageError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Stop(#[from] PidError),
    #[error("failed to prepare {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("background task failed: {0}")]
    Join(String),
}

impl OpError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OpError::Storage(StorageError::NotFound { .. }) => ErrorCode::NotFound,
            OpError::Storage(StorageError::Ambiguous { .. }) => ErrorCode::Ambiguous,
            OpError::Storage(StorageError::Archived { .. }) => ErrorCode::Archived,
            OpError::Storage(StorageError::InvalidReference { .. }) => ErrorCode::InvalidArgs,
            OpError::Storage(_) | OpError::Io { .. } | OpError::Join(_) => ErrorCode::Storage,
            OpError::Stop(_) => ErrorCode::StopFailed,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}

/// Attaches the derived lifecycle state. Archived missions never look at their
/// process record.
pub fn mission_view(instance: &Instance, mission: Mission) -> MissionView {
    let pid_path = instance.mission_pid_path(&mission.id);
    let mut pid = None;
    let state = MissionState::derive(mission.status, || {
        pid = live_pid(&pid_path);
        pid.is_some()
    });
    MissionView {
        mission,
        state,
        pid,
    }
}

/// Mission operations against the registry and the per-mission process
/// records. The control server and the direct fallback both go through here,
/// so the two paths cannot drift apart.
///
/// Each call opens its own registry connection; the registry's transactions are
/// the only serialization point.
#[derive(Debug, Clone)]
pub struct MissionOps {
    instance: Instance,
    stop_policy: StopPolicy,
}

impl MissionOps {
    pub fn new(instance: Instance, stop_policy: StopPolicy) -> Self {
        Self {
            instance,
            stop_policy,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    fn store(&self) -> Result<MissionStore, OpError> {
        Ok(MissionStore::open(self.instance.registry_path())?)
    }

    pub fn list(&self, filter: &MissionFilter) -> Result<Vec<MissionView>, OpError> {
        let missions = self.store()?.list(filter)?;
        Ok(missions
            .into_iter()
            .map(|mission| mission_view(&self.instance, mission))
            .collect())
    }

    pub fn get(&self, reference: &str) -> Result<MissionView, OpError> {
        let mission = self.store()?.get(reference)?;
        Ok(mission_view(&self.instance, mission))
    }

    /// Creates the record and its (empty) workspace directory.
    pub fn create(&self, new: &NewMission) -> Result<MissionView, OpError> {
        let id = new_mission_id();
        let workspace = self.instance.mission_workspace(&id);
        std::fs::create_dir_all(&workspace).map_err(|source| OpError::Io {
            path: workspace.clone(),
            source,
        })?;
        let mission = self.store()?.create(&id, new, &workspace)?;
        info!(
            event = "mission_create",
            id = %mission.id,
            repo = mission.repo.as_deref().unwrap_or(""),
            cron = mission.cron_job.as_deref().unwrap_or("")
        );
        Ok(mission_view(&self.instance, mission))
    }

    pub fn update(&self, reference: &str, patch: &MissionPatch) -> Result<MissionView, OpError> {
        let mission = self.store()?.update(reference, patch)?;
        Ok(mission_view(&self.instance, mission))
    }

    pub fn bind(&self, reference: &str, pane: Option<u64>) -> Result<MissionView, OpError> {
        let mission = self.store()?.bind(reference, pane)?;
        Ok(mission_view(&self.instance, mission))
    }

    pub fn heartbeat(&self, reference: &str) -> Result<MissionView, OpError> {
        let mission = self.store()?.heartbeat(reference)?;
        Ok(mission_view(&self.instance, mission))
    }

    /// Idempotent: a mission with no live wrapper reports `not_running`.
    ///
    /// Archived missions are never checked or signalled; a leftover record is
    /// only deleted, since its PID may belong to an unrelated process by now.
    pub async fn stop(&self, reference: &str) -> Result<StopReport, OpError> {
        let mission = self.blocking_get(reference).await?;
        let pid_path = self.instance.mission_pid_path(&mission.id);
        let outcome = if mission.status.is_archived() {
            remove_pid(&pid_path);
            StopOutcome::NotRunning
        } else {
            stop_process(&pid_path, self.stop_policy).await?
        };
        info!(event = "mission_stop", id = %mission.id, outcome = outcome.as_str());
        Ok(StopReport {
            id: mission.id,
            outcome,
        })
    }

    /// Stops first; the record is only archived once the wrapper is confirmed
    /// dead. Archiving an archived mission touches nothing.
    pub async fn archive(&self, reference: &str) -> Result<MissionView, OpError> {
        let current = self.blocking_get(reference).await?;
        if current.status.is_archived() {
            return Ok(mission_view(&self.instance, current));
        }
        let report = self.stop(&current.id).await?;
        let ops = self.clone();
        let id = report.id.clone();
        let mission =
            tokio::task::spawn_blocking(move || ops.store()?.archive(&id).map_err(OpError::from))
                .await
                .map_err(|err| OpError::Join(err.to_string()))??;
        info!(event = "mission_archive", id = %mission.id);
        Ok(mission_view(&self.instance, mission))
    }

    async fn blocking_get(&self, reference: &str) -> Result<Mission, OpError> {
        let ops = self.clone();
        let reference = reference.to_string();
        tokio::task::spawn_blocking(move || ops.store()?.get(&reference).map_err(OpError::from))
            .await
            .map_err(|err| OpError::Join(err.to_string()))?
    }

    /// Stops every wrapper that still has a process record on disk, registered
    /// or not. Failures are logged and skipped.
    pub async fn stop_all_wrappers(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(self.instance.missions_dir()) else {
            return 0;
        };
        let mut stopped = 0;
        for entry in entries.flatten() {
            let pid_path = entry.path().join("wrapper.pid");
            if !pid_path.exists() {
                continue;
            }
            match stop_process(&pid_path, self.stop_policy).await {
                Ok(StopOutcome::NotRunning) => {}
                Ok(_) => stopped += 1,
                Err(err) => {
                    warn!(event = "wrapper_stop_error", path = %pid_path.display(), error = %err)
                }
            }
        }
        stopped
    }
}
