use crate::ops::{MissionOps, OpError};
use fs2::FileExt;
use mctl_core::instance::{Instance, InstanceError};
use mctl_core::ipc::{
    decode_frame, encode_frame, Envelope, ErrorCode, ErrorPayload, HealthPayload, Msg, Reply,
    DEFAULT_MAX_FRAME_BYTES,
};
use mctl_core::pidfile::{read_pid, remove_pid, write_pid, PidError, StopPolicy};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("another control server holds {0}")]
    AlreadyRunning(PathBuf),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Pid(#[from] PidError),
    #[error("registry unavailable: {0}")]
    Registry(#[from] OpError),
    #[error("control socket error at {path}: {source}")]
    Socket { path: PathBuf, source: io::Error },
    #[error("lock file error at {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub instance: Instance,
    pub version: String,
    pub stop_policy: StopPolicy,
    pub max_frame_bytes: usize,
    /// Recorded in `run/server.pid` and reported by health.
    pub pid: u32,
}

impl ServerConfig {
    pub fn new(instance: Instance, stop_policy: StopPolicy) -> Self {
        Self {
            instance,
            version: crate::VERSION.to_string(),
            stop_policy,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            pid: std::process::id(),
        }
    }
}

/// Exclusive advisory lock on `run/server.lock`, held for the server's lifetime.
struct ServerLock {
    file: File,
}

impl ServerLock {
    fn acquire(path: PathBuf) -> Result<Self, ServerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| ServerError::Lock {
                path: path.clone(),
                source,
            })?;
        if file.try_lock_exclusive().is_err() {
            return Err(ServerError::AlreadyRunning(path));
        }
        Ok(Self { file })
    }
}

impl Drop for ServerLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

struct ServerState {
    ops: MissionOps,
    version: String,
    pid: u32,
    max_frame_bytes: usize,
    conn_counter: AtomicU64,
}

/// Runs the control server until `shutdown` flips to true. In-flight requests
/// are finished before the socket and PID file are removed.
pub async fn run(
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let instance = config.instance.clone();
    instance.ensure_dirs()?;
    let _lock = ServerLock::acquire(instance.server_lock_path())?;

    let pid = config.pid;
    let pid_path = instance.server_pid_path();
    write_pid(&pid_path, pid)?;

    let ops = MissionOps::new(instance.clone(), config.stop_policy);
    let probe = ops.clone();
    tokio::task::spawn_blocking(move || probe.list(&Default::default()).map(|_| ()))
        .await
        .map_err(|err| OpError::Join(err.to_string()))??;

    let socket_path = instance.socket_path();
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path).map_err(|source| ServerError::Socket {
        path: socket_path.clone(),
        source,
    })?;
    let _ = fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600));

    let state = Arc::new(ServerState {
        ops,
        version: config.version.clone(),
        pid,
        max_frame_bytes: config.max_frame_bytes,
        conn_counter: AtomicU64::new(0),
    });

    info!(
        event = "control_server_start",
        pid,
        version = %config.version,
        socket = %socket_path.display()
    );

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            state.handle_connection(stream, shutdown).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "control_accept_error", error = %err);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let in_flight = connections.len();
    if in_flight > 0 {
        debug!(event = "control_server_drain", connections = in_flight);
    }
    while connections.join_next().await.is_some() {}

    let _ = fs::remove_file(&socket_path);
    if read_pid(&pid_path) == Some(pid) {
        remove_pid(&pid_path);
    }
    info!(event = "control_server_stop", pid);
    Ok(())
}

/// Installs SIGTERM/SIGINT handlers and serves until one arrives.
pub async fn serve_until_signal(config: ServerConfig) -> Result<(), ServerError> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!(event = "control_server_signal");
        let _ = tx.send(true);
    });
    run(config, rx).await
}

async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(err) => {
            warn!(event = "control_signal_error", error = %err);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

impl ServerState {
    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("control-conn-{id}")
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: UnixStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let conn_id = self.next_conn_id();
        let (reader_half, mut writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        loop {
            let envelope = tokio::select! {
                next = read_next_valid_frame(&mut reader, self.max_frame_bytes) => next,
                _ = shutdown.changed() => None,
            };
            let Some(envelope) = envelope else {
                break;
            };

            let request_id = envelope.request_id.clone();
            let kind = envelope.msg.kind();
            let msg = self.dispatch(envelope).await;
            if let Msg::Error(err) = &msg {
                debug!(
                    event = "control_request_error",
                    conn_id = %conn_id,
                    request = kind,
                    code = %err.code,
                    message = %err.message
                );
            }

            let reply = Envelope::new(request_id, msg);
            let frame = match encode_frame(&reply, self.max_frame_bytes) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(event = "control_encode_error", conn_id = %conn_id, error = %err);
                    let fallback = Envelope::new(
                        reply.request_id.clone(),
                        Msg::Error(ErrorPayload::new(ErrorCode::Storage, err.to_string())),
                    );
                    match encode_frame(&fallback, self.max_frame_bytes) {
                        Ok(frame) => frame,
                        Err(_) => break,
                    }
                }
            };
            let write = async {
                writer_half.write_all(&frame).await?;
                writer_half.flush().await
            };
            if let Err(err) = write.await {
                debug!(event = "control_write_error", conn_id = %conn_id, error = %err);
                break;
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> Msg {
        if envelope.version.0 > mctl_core::ipc::CURRENT_PROTOCOL_VERSION {
            return Msg::Error(ErrorPayload::new(
                ErrorCode::UnsupportedVersion,
                format!("protocol version {} is not supported", envelope.version.0),
            ));
        }
        match self.answer(envelope.msg).await {
            Ok(reply) => Msg::Result(reply),
            Err(err) => Msg::Error(err),
        }
    }

    async fn answer(&self, msg: Msg) -> Result<Reply, ErrorPayload> {
        match msg {
            Msg::Health(query) => {
                if let Some(client) = query.client_version.as_deref() {
                    if client != self.version {
                        debug!(event = "control_version_skew", client, server = %self.version);
                    }
                }
                Ok(Reply::Health(HealthPayload {
                    status: "ok".to_string(),
                    version: self.version.clone(),
                    pid: self.pid,
                }))
            }
            Msg::ListMissions(filter) => {
                self.blocking(move |ops| ops.list(&filter))
                    .await
                    .map(Reply::Missions)
            }
            Msg::GetMission(target) => {
                self.blocking(move |ops| ops.get(&target.id))
                    .await
                    .map(Reply::Mission)
            }
            Msg::CreateMission(new) => {
                self.blocking(move |ops| ops.create(&new))
                    .await
                    .map(Reply::Mission)
            }
            Msg::UpdateMission(update) => {
                self.blocking(move |ops| ops.update(&update.id, &update.patch))
                    .await
                    .map(Reply::Mission)
            }
            Msg::BindMission(bind) => {
                self.blocking(move |ops| ops.bind(&bind.id, bind.pane))
                    .await
                    .map(Reply::Mission)
            }
            Msg::Heartbeat(target) => {
                self.blocking(move |ops| ops.heartbeat(&target.id))
                    .await
                    .map(Reply::Mission)
            }
            Msg::StopMission(target) => self
                .ops
                .stop(&target.id)
                .await
                .map(Reply::Stopped)
                .map_err(|err| err.to_payload()),
            Msg::ArchiveMission(target) => self
                .ops
                .archive(&target.id)
                .await
                .map(Reply::Mission)
                .map_err(|err| err.to_payload()),
            Msg::Result(_) | Msg::Error(_) => Err(ErrorPayload::new(
                ErrorCode::InvalidArgs,
                "replies are not accepted as requests",
            )),
        }
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, ErrorPayload>
    where
        T: Send + 'static,
        F: FnOnce(&MissionOps) -> Result<T, OpError> + Send + 'static,
    {
        let ops = self.ops.clone();
        match tokio::task::spawn_blocking(move || work(&ops)).await {
            Ok(result) => result.map_err(|err| err.to_payload()),
            Err(err) => Err(OpError::Join(err.to_string()).to_payload()),
        }
    }
}

async fn read_next_valid_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    max_frame_bytes: usize,
) -> Option<Envelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "control_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<Envelope>(&line, max_frame_bytes) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "control_decode_error", error = %err);
                continue;
            }
        }
    }
}
