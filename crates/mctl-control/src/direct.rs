use crate::client::{ClientError, ControlClient};
use crate::ops::{MissionOps, OpError};
use mctl_core::instance::Instance;
use mctl_core::ipc::StopReport;
use mctl_core::pidfile::StopPolicy;
use mctl_core::{MissionFilter, MissionPatch, MissionView, NewMission};
use std::time::Duration;
use tracing::debug;

impl From<OpError> for ClientError {
    fn from(err: OpError) -> Self {
        ClientError::Remote {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Works on the registry and process records in-process, for when no control
/// server answers.
#[derive(Debug, Clone)]
pub struct DirectControl {
    ops: MissionOps,
}

impl DirectControl {
    pub fn new(instance: Instance, stop_policy: StopPolicy) -> Self {
        Self {
            ops: MissionOps::new(instance, stop_policy),
        }
    }

    pub fn ops(&self) -> &MissionOps {
        &self.ops
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&MissionOps) -> Result<T, OpError> + Send + 'static,
    {
        let ops = self.ops.clone();
        tokio::task::spawn_blocking(move || work(&ops))
            .await
            .map_err(|err| OpError::Join(err.to_string()))?
            .map_err(ClientError::from)
    }
}

/// Every foreground command talks through this: the server when it is up,
/// the registry directly otherwise. Both paths answer with the same semantics.
#[derive(Debug, Clone)]
pub enum ControlHandle {
    Server(ControlClient),
    Direct(DirectControl),
}

impl ControlHandle {
    pub async fn connect(instance: &Instance, stop_policy: StopPolicy) -> Self {
        let stop_timeout = stop_policy.deadline + Duration::from_secs(10);
        let client = ControlClient::new(instance.socket_path()).with_stop_timeout(stop_timeout);
        match client.health().await {
            Ok(health) if health.is_ok() => ControlHandle::Server(client),
            Ok(health) => {
                debug!(event = "control_fallback_direct", status = %health.status);
                ControlHandle::Direct(DirectControl::new(instance.clone(), stop_policy))
            }
            Err(err) => {
                debug!(event = "control_fallback_direct", error = %err);
                ControlHandle::Direct(DirectControl::new(instance.clone(), stop_policy))
            }
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ControlHandle::Direct(_))
    }

    pub async fn list(&self, filter: &MissionFilter) -> Result<Vec<MissionView>, ClientError> {
        match self {
            ControlHandle::Server(client) => client.list(filter).await,
            ControlHandle::Direct(direct) => {
                let filter = filter.clone();
                direct.blocking(move |ops| ops.list(&filter)).await
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<MissionView, ClientError> {
        match self {
            ControlHandle::Server(client) => client.get(id).await,
            ControlHandle::Direct(direct) => {
                let id = id.to_string();
                direct.blocking(move |ops| ops.get(&id)).await
            }
        }
    }

    pub async fn create(&self, new: &NewMission) -> Result<MissionView, ClientError> {
        match self {
            ControlHandle::Server(client) => client.create(new).await,
            ControlHandle::Direct(direct) => {
                let new = new.clone();
                direct.blocking(move |ops| ops.create(&new)).await
            }
        }
    }

    pub async fn update(&self, id: &str, patch: &MissionPatch) -> Result<MissionView, ClientError> {
        match self {
            ControlHandle::Server(client) => client.update(id, patch).await,
            ControlHandle::Direct(direct) => {
                let id = id.to_string();
                let patch = patch.clone();
                direct.blocking(move |ops| ops.update(&id, &patch)).await
            }
        }
    }

    pub async fn bind(&self, id: &str, pane: Option<u64>) -> Result<MissionView, ClientError> {
        match self {
            ControlHandle::Server(client) => client.bind(id, pane).await,
            ControlHandle::Direct(direct) => {
                let id = id.to_string();
                direct.blocking(move |ops| ops.bind(&id, pane)).await
            }
        }
    }

    pub async fn heartbeat(&self, id: &str) -> Result<MissionView, ClientError> {
        match self {
            ControlHandle::Server(client) => client.heartbeat(id).await,
            ControlHandle::Direct(direct) => {
                let id = id.to_string();
                direct.blocking(move |ops| ops.heartbeat(&id)).await
            }
        }
    }

    pub async fn stop(&self, id: &str) -> Result<StopReport, ClientError> {
        match self {
            ControlHandle::Server(client) => client.stop(id).await,
            ControlHandle::Direct(direct) => Ok(direct.ops.stop(id).await?),
        }
    }

    pub async fn archive(&self, id: &str) -> Result<MissionView, ClientError> {
        match self {
            ControlHandle::Server(client) => client.archive(id).await,
            ControlHandle::Direct(direct) => Ok(direct.ops.archive(id).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctl_core::ipc::ErrorCode;
    use mctl_core::MissionState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn unreachable_server_falls_back_to_direct() {
        let dir = TempDir::new().expect("tempdir");
        let instance = Instance::new(dir.path());
        instance.ensure_dirs().expect("dirs");

        let handle = ControlHandle::connect(&instance, StopPolicy::default()).await;
        assert!(handle.is_direct());

        let created = handle
            .create(&NewMission {
                name: Some("fallback".to_string()),
                ..NewMission::default()
            })
            .await
            .expect("create");
        let listed = handle.list(&MissionFilter::default()).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].mission.id, created.mission.id);
        assert_eq!(listed[0].state, MissionState::Stopped);

        let err = handle.get("0badc0de").await.expect_err("missing");
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
    }
}
