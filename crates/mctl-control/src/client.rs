use mctl_core::ipc::{
    decode_frame, encode_frame, BindMission, Envelope, ErrorCode, FrameError, HealthPayload,
    HealthQuery, MissionRef, Msg, Reply, StopReport, UpdateMission, DEFAULT_MAX_FRAME_BYTES,
};
use mctl_core::{MissionFilter, MissionPatch, MissionView, NewMission};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Covers the stop routine's deadline plus the forceful-kill confirmation.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control server not reachable at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },
    #[error("control server i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("control server did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("control server closed the connection")]
    Closed,
    #[error("unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClientError::Connect { .. } | ClientError::Timeout(_))
    }
}

/// One request per connection: connect, write a frame, read the reply line.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    request_timeout: Duration,
    stop_timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout: REQUEST_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    /// Stop and archive wait this long; it must exceed the server's stop deadline.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn health(&self) -> Result<HealthPayload, ClientError> {
        let msg = Msg::Health(HealthQuery {
            client_version: Some(crate::VERSION.to_string()),
        });
        match self.request(msg, HEALTH_TIMEOUT).await? {
            Reply::Health(payload) => Ok(payload),
            _ => Err(ClientError::UnexpectedReply { request: "health" }),
        }
    }

    pub async fn list(&self, filter: &MissionFilter) -> Result<Vec<MissionView>, ClientError> {
        match self
            .request(Msg::ListMissions(filter.clone()), self.request_timeout)
            .await?
        {
            Reply::Missions(missions) => Ok(missions),
            _ => Err(ClientError::UnexpectedReply {
                request: "missions/list",
            }),
        }
    }

    pub async fn get(&self, id: &str) -> Result<MissionView, ClientError> {
        let msg = Msg::GetMission(MissionRef { id: id.to_string() });
        self.expect_mission(msg, self.request_timeout).await
    }

    pub async fn create(&self, new: &NewMission) -> Result<MissionView, ClientError> {
        self.expect_mission(Msg::CreateMission(new.clone()), self.request_timeout)
            .await
    }

    pub async fn update(&self, id: &str, patch: &MissionPatch) -> Result<MissionView, ClientError> {
        let msg = Msg::UpdateMission(UpdateMission {
            id: id.to_string(),
            patch: patch.clone(),
        });
        self.expect_mission(msg, self.request_timeout).await
    }

    pub async fn bind(&self, id: &str, pane: Option<u64>) -> Result<MissionView, ClientError> {
        let msg = Msg::BindMission(BindMission {
            id: id.to_string(),
            pane,
        });
        self.expect_mission(msg, self.request_timeout).await
    }

    pub async fn heartbeat(&self, id: &str) -> Result<MissionView, ClientError> {
        let msg = Msg::Heartbeat(MissionRef { id: id.to_string() });
        self.expect_mission(msg, self.request_timeout).await
    }

    pub async fn stop(&self, id: &str) -> Result<StopReport, ClientError> {
        let msg = Msg::StopMission(MissionRef { id: id.to_string() });
        match self.request(msg, self.stop_timeout).await? {
            Reply::Stopped(report) => Ok(report),
            _ => Err(ClientError::UnexpectedReply {
                request: "missions/stop",
            }),
        }
    }

    pub async fn archive(&self, id: &str) -> Result<MissionView, ClientError> {
        let msg = Msg::ArchiveMission(MissionRef { id: id.to_string() });
        self.expect_mission(msg, self.stop_timeout).await
    }

    async fn expect_mission(&self, msg: Msg, timeout: Duration) -> Result<MissionView, ClientError> {
        let request = msg.kind();
        match self.request(msg, timeout).await? {
            Reply::Mission(view) => Ok(view),
            _ => Err(ClientError::UnexpectedReply { request }),
        }
    }

    pub async fn request(&self, msg: Msg, timeout: Duration) -> Result<Reply, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let kind = msg.kind();
        let envelope = Envelope::new(Some(request_id.clone()), msg);
        let exchange = self.exchange(&envelope);
        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        if reply.request_id.as_deref().is_some_and(|id| id != request_id) {
            debug!(event = "control_request_id_mismatch", request = kind);
        }
        match reply.msg {
            Msg::Result(reply) => Ok(reply),
            Msg::Error(err) => Err(ClientError::Remote {
                code: err.code,
                message: err.message,
            }),
            _ => Err(ClientError::UnexpectedReply { request: kind }),
        }
    }

    async fn exchange(&self, envelope: &Envelope) -> Result<Envelope, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let (reader_half, mut writer_half) = stream.into_split();

        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)?;
        writer_half.write_all(&frame).await?;
        writer_half.flush().await?;

        let mut reader = BufReader::new(reader_half);
        loop {
            let mut line = Vec::new();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(ClientError::Closed);
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Ok(decode_frame(&line, DEFAULT_MAX_FRAME_BYTES)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_socket_is_unreachable() {
        let dir = TempDir::new().expect("tempdir");
        let client = ControlClient::new(dir.path().join("control.sock"));
        let err = client.health().await.expect_err("no server");
        assert!(err.is_unreachable(), "unexpected error: {err}");
        assert_eq!(err.code(), None);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("control.sock");
        let listener = tokio::net::UnixListener::bind(&path).expect("bind");
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = ControlClient::new(&path);
        let err = client
            .request(Msg::Health(HealthQuery::default()), Duration::from_millis(200))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ClientError::Timeout(_)));
        hold.abort();
    }
}
