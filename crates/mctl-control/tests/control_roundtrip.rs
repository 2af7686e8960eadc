use mctl_control::client::ControlClient;
use mctl_control::server::{self, ServerConfig};
use mctl_core::instance::Instance;
use mctl_core::ipc::{decode_frame, ErrorCode, DEFAULT_MAX_FRAME_BYTES};
use mctl_core::pidfile::{write_pid, StopOutcome, StopPolicy};
use mctl_core::{MissionFilter, MissionPatch, MissionState, NewMission};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Harness {
    _dir: TempDir,
    instance: Instance,
    client: ControlClient,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), server::ServerError>>,
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..150 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket did not appear at {}", path.display());
}

async fn launch() -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let instance = Instance::new(dir.path());
    let policy = StopPolicy {
        tick: Duration::from_millis(50),
        deadline: Duration::from_secs(2),
    };
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(server::run(ServerConfig::new(instance.clone(), policy), rx));
    wait_for_socket(&instance.socket_path()).await;
    Harness {
        client: ControlClient::new(instance.socket_path()),
        instance,
        _dir: dir,
        shutdown: tx,
        handle,
    }
}

fn spawn_reaped_sleep() -> u32 {
    let mut child = Command::new("sleep")
        .arg("30")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn sleep");
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    pid
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_version_and_pid() {
    let harness = launch().await;
    let health = harness.client.health().await.expect("health");
    assert!(health.is_ok());
    assert_eq!(health.version, mctl_control::VERSION);
    assert_eq!(health.pid, std::process::id());

    harness.shutdown.send(true).expect("shutdown");
    harness.handle.await.expect("join").expect("server");
    assert!(!harness.instance.socket_path().exists());
    assert!(!harness.instance.server_pid_path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mission_lifecycle_over_the_socket() {
    let harness = launch().await;
    let client = &harness.client;

    let created = client
        .create(&NewMission {
            name: Some("flaky-tests".to_string()),
            repo: Some("acme/widgets".to_string()),
            cron_job: Some("nightly".to_string()),
            ..NewMission::default()
        })
        .await
        .expect("create");
    assert_eq!(created.state, MissionState::Stopped);
    let id = created.mission.id.clone();
    let short = created.mission.short_id().to_string();

    let fetched = client.get(&short).await.expect("get by short id");
    assert_eq!(fetched.mission.id, id);

    let nightly = client
        .list(&MissionFilter {
            include_archived: false,
            cron_job: Some("nightly".to_string()),
        })
        .await
        .expect("list");
    assert_eq!(nightly.len(), 1);
    let other = client
        .list(&MissionFilter {
            include_archived: false,
            cron_job: Some("weekly".to_string()),
        })
        .await
        .expect("list weekly");
    assert!(other.is_empty());

    let updated = client
        .update(
            &short,
            &MissionPatch {
                description: Some("quarantine the flaky suite".to_string()),
                config_snapshot: Some("snap-7".to_string()),
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.mission.config_snapshot.as_deref(), Some("snap-7"));

    let pid_path = harness.instance.mission_pid_path(&id);
    write_pid(&pid_path, spawn_reaped_sleep()).expect("wrapper pid");
    let bound = client.bind(&id, Some(12)).await.expect("bind");
    assert_eq!(bound.mission.pane_id, Some(12));
    assert_eq!(bound.state, MissionState::Running);

    let stopped = client.stop(&short).await.expect("stop");
    assert_eq!(stopped.outcome, StopOutcome::Terminated);
    let again = client.stop(&short).await.expect("stop again");
    assert_eq!(again.outcome, StopOutcome::NotRunning);

    let archived = client.archive(&id).await.expect("archive");
    assert_eq!(archived.state, MissionState::Archived);

    let err = client.heartbeat(&id).await.expect_err("archived heartbeat");
    assert_eq!(err.code(), Some(ErrorCode::Archived));
    assert!(client
        .list(&MissionFilter::default())
        .await
        .expect("list active")
        .is_empty());

    let err = client.get("0badc0de").await.expect_err("missing");
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    harness.shutdown.send(true).expect("shutdown");
    harness.handle.await.expect("join").expect("server");
}

/// A wrapper that ignores SIGTERM, so a stop has to wait out the deadline.
fn spawn_reaped_stubborn() -> u32 {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg("trap '' TERM; exec sleep 30")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn stubborn");
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    pid
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_finishes_a_stop_already_in_flight() {
    let harness = launch().await;
    let created = harness
        .client
        .create(&NewMission::default())
        .await
        .expect("create");
    let id = created.mission.id.clone();
    let pid_path = harness.instance.mission_pid_path(&id);
    write_pid(&pid_path, spawn_reaped_stubborn()).expect("wrapper pid");
    // Let the shell install its trap before anything is signalled.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = harness.client.clone();
    let stopping = tokio::spawn(async move { client.stop(&id).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!stopping.is_finished(), "stop should still be waiting on the wrapper");

    harness.shutdown.send(true).expect("shutdown");
    let report = stopping.await.expect("join").expect("stop reply");
    assert_eq!(report.outcome, StopOutcome::Killed);
    assert!(!pid_path.exists());

    harness.handle.await.expect("join").expect("server");
    assert!(!harness.instance.socket_path().exists());
    assert!(!harness.instance.server_pid_path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_lines_are_skipped_and_newer_versions_refused() {
    let harness = launch().await;
    let stream = UnixStream::connect(harness.instance.socket_path())
        .await
        .expect("connect");
    let (reader_half, mut writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);

    writer_half
        .write_all(b"this is not json\n")
        .await
        .expect("write garbage");
    writer_half
        .write_all(
            br#"{"version":"9","request_id":"r1","timestamp":"t","type":"health","payload":{}}"#,
        )
        .await
        .expect("write future");
    writer_half.write_all(b"\n").await.expect("newline");

    let mut line = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
        .await
        .expect("read timeout")
        .expect("read");
    let value: serde_json::Value = decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode");
    assert_eq!(value["type"], "error");
    assert_eq!(value["request_id"], "r1");
    assert_eq!(value["payload"]["code"], "unsupported_version");

    drop(writer_half);
    harness.shutdown.send(true).expect("shutdown");
    harness.handle.await.expect("join").expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_are_served_independently() {
    let harness = launch().await;
    let created = harness
        .client
        .create(&NewMission::default())
        .await
        .expect("create");

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let client = harness.client.clone();
        let id = created.mission.id.clone();
        tasks.push(tokio::spawn(async move {
            client
                .update(
                    &id,
                    &MissionPatch {
                        description: Some(format!("worker {worker}")),
                        config_snapshot: None,
                    },
                )
                .await
                .expect("update");
            client.heartbeat(&id).await.expect("heartbeat");
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    let view = harness.client.get(&created.mission.id).await.expect("get");
    assert!(view
        .mission
        .description
        .as_deref()
        .is_some_and(|text| text.starts_with("worker ")));
    assert!(view.mission.last_heartbeat.is_some());

    harness.shutdown.send(true).expect("shutdown");
    harness.handle.await.expect("join").expect("server");
}
