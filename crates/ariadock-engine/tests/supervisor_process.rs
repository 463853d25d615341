//! Supervisor behavior against real child processes (small shell scripts
//! standing in for the worker).

#![cfg(unix)]

use ariadock_engine::config::{self, ConfigStore};
use ariadock_engine::supervisor::{
    ConfigUpdate, Phase, Supervisor, SupervisorTimings, WorkerEvent, WorkerProcessConfig,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const RUN_FOREVER: &str = "trap 'exit 0' TERM\nwhile true; do sleep 0.05; done\n";

fn fast_timings() -> SupervisorTimings {
    SupervisorTimings {
        start_timeout: Duration::from_secs(2),
        start_grace: Duration::from_millis(150),
        stop_timeout: Duration::from_millis(500),
        crash_restart_delay: Duration::from_millis(100),
        max_crash_retries: 3,
        cleanup_poll: Duration::from_millis(20),
        cleanup_attempts: 25,
        port_settle: Duration::from_millis(50),
        config_settle: Duration::from_millis(50),
        config_verify_interval: Duration::from_millis(20),
        config_verify_retries: 5,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("aria2c");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn worker_config(dir: &Path, executable: PathBuf, port: u16) -> WorkerProcessConfig {
    let config_file = dir.join("aria2/aria2.conf");
    let mut store = ConfigStore::open_or_create(&config_file, &dir.join("downloads")).unwrap();
    store.set(config::KEY_PORT, port).unwrap();
    WorkerProcessConfig {
        executable,
        config_file,
        session_file: dir.join("aria2/aria2.session"),
        port,
        secret: None,
        download_dir: dir.join("downloads"),
        enable_rpc: true,
        rpc_allow_origin_all: true,
        auto_start: true,
    }
}

fn supervisor_with(dir: &Path, body: &str) -> Arc<Supervisor> {
    let exe = write_script(dir, body);
    Supervisor::new(worker_config(dir, exe, free_port()), fast_timings())
}

async fn next_event(rx: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for worker event")
        .expect("event channel closed")
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<WorkerEvent>, mut pred: F) -> WorkerEvent
where
    F: FnMut(&WorkerEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn start_passes_only_the_config_path() {
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args.txt");
    let body = format!("echo \"$#:$1\" > {}\n{RUN_FOREVER}", args_file.display());
    let supervisor = supervisor_with(dir.path(), &body);

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());

    let args = std::fs::read_to_string(&args_file).unwrap();
    let expected = format!("1:--conf-path={}\n", dir.path().join("aria2/aria2.conf").display());
    assert_eq!(args, expected);

    // Session keys are written once.
    let store = ConfigStore::load(&dir.path().join("aria2/aria2.conf")).unwrap();
    let session = dir.path().join("aria2/aria2.session").display().to_string();
    assert_eq!(store.get(config::KEY_INPUT_FILE), Some(session.as_str()));
    assert_eq!(store.get(config::KEY_SAVE_SESSION), Some(session.as_str()));
    assert!(dir.path().join("aria2/aria2.session").exists());

    supervisor.stop().await.unwrap();
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn start_twice_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), RUN_FOREVER);
    supervisor.start().await.unwrap();
    let pid = supervisor.status().pid;
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status().pid, pid);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn early_exit_fails_start_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), "exit 2\n");
    let mut events = supervisor.subscribe();

    let err = supervisor.start().await.unwrap_err();
    assert_eq!(err.code(), "exited_during_start");
    assert!(err.to_string().contains("Some(2)"));
    assert!(!supervisor.is_running());

    // A start failure is not a crash: nothing is scheduled.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, WorkerEvent::RestartScheduled { .. }));
    }
    assert_eq!(supervisor.retry_count(), 0);
}

#[tokio::test]
async fn concurrent_lifecycle_calls_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), RUN_FOREVER);

    let starting = {
        let s = supervisor.clone();
        tokio::spawn(async move { s.start().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(supervisor.phase(), Phase::Starting);

    let err = supervisor.restart().await.unwrap_err();
    assert_eq!(err.code(), "busy");
    let err = supervisor.start().await.unwrap_err();
    assert_eq!(err.code(), "busy");

    starting.await.unwrap().unwrap();
    assert_eq!(supervisor.phase(), Phase::Idle);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn stubborn_worker_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), "trap '' TERM\nwhile true; do sleep 0.05; done\n");
    supervisor.start().await.unwrap();

    let started = std::time::Instant::now();
    supervisor.stop().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn crash_schedules_one_restart_and_counts_it() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crashed");
    // Crash on the first run only.
    let body = format!(
        "if [ ! -f {m} ]; then touch {m}; sleep 0.3; exit 1; fi\n{RUN_FOREVER}",
        m = marker.display()
    );
    let supervisor = supervisor_with(dir.path(), &body);
    let mut events = supervisor.subscribe();

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.retry_count(), 0);

    let scheduled = wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::RestartScheduled { .. })
    })
    .await;
    assert_eq!(
        scheduled,
        WorkerEvent::RestartScheduled {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );
    assert_eq!(supervisor.retry_count(), 1);

    wait_for(&mut events, |e| matches!(e, WorkerEvent::Started { .. })).await;
    assert!(supervisor.is_running());
    // Crash restarts keep the counter.
    assert_eq!(supervisor.retry_count(), 1);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn repeated_crashes_stop_at_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), "sleep 0.3\nexit 1\n");
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();

    let mut scheduled = 0;
    let attempts = loop {
        match next_event(&mut events).await {
            WorkerEvent::RestartScheduled { .. } => scheduled += 1,
            WorkerEvent::RetriesExhausted { attempts } => break attempts,
            _ => {}
        }
    };
    assert_eq!(scheduled, 3);
    assert_eq!(attempts, 3);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!supervisor.is_running());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, WorkerEvent::RestartScheduled { .. }));
    }
}

#[tokio::test]
async fn clean_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), "sleep 0.3\nexit 0\n");
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();

    let exited = wait_for(&mut events, |e| matches!(e, WorkerEvent::Exited(_))).await;
    match exited {
        WorkerEvent::Exited(info) => assert_eq!(info.code, Some(0)),
        other => panic!("unexpected {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(supervisor.retry_count(), 0);
}

#[tokio::test]
async fn stop_cancels_pending_crash_restart() {
    let dir = tempfile::tempdir().unwrap();
    let exe = write_script(dir.path(), "sleep 0.3\nexit 1\n");
    let mut timings = fast_timings();
    timings.crash_restart_delay = Duration::from_millis(400);
    let supervisor = Supervisor::new(worker_config(dir.path(), exe, free_port()), timings);
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::RestartScheduled { .. })
    })
    .await;
    supervisor.stop().await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, WorkerEvent::Started { .. }));
    }
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn held_port_fails_with_retryable_error() {
    let dir = tempfile::tempdir().unwrap();
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let exe = write_script(dir.path(), RUN_FOREVER);
    let mut timings = fast_timings();
    timings.start_timeout = Duration::from_millis(400);
    let supervisor = Supervisor::new(worker_config(dir.path(), exe, port), timings);

    let err = supervisor.start().await.unwrap_err();
    assert_eq!(err.code(), "port_in_use");
    assert!(err.is_retryable());
    drop(holder);
}

#[tokio::test]
async fn restart_replaces_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), RUN_FOREVER);
    supervisor.start().await.unwrap();
    let first = supervisor.status().pid.unwrap();

    supervisor.restart().await.unwrap();
    let second = supervisor.status().pid.unwrap();
    assert_ne!(first, second);
    assert!(supervisor.is_running());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn failed_restart_leaves_worker_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("launched");
    // Runs the first time, dies on every later launch.
    let body = format!(
        "if [ -f {m} ]; then exit 3; fi\ntouch {m}\n{RUN_FOREVER}",
        m = marker.display()
    );
    let supervisor = supervisor_with(dir.path(), &body);
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();

    let err = supervisor.restart().await.unwrap_err();
    assert_eq!(err.code(), "exited_during_start");
    assert!(err.to_string().contains("Some(3)"));

    let status = supervisor.status();
    assert!(!status.running);
    assert!(status.pid.is_none());
    assert_eq!(supervisor.phase(), Phase::Idle);

    // The failed launch is not treated as a crash.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, WorkerEvent::RestartScheduled { .. }));
    }
    assert_eq!(supervisor.retry_count(), 0);
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn port_change_while_running_restarts_on_new_port() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), RUN_FOREVER);
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::Started { .. })).await;
    let first = supervisor.status().pid;

    let new_port = free_port();
    let scheduled = supervisor
        .update_config(ConfigUpdate {
            port: Some(new_port),
            ..Default::default()
        })
        .unwrap();
    assert!(scheduled);

    wait_for(&mut events, |e| matches!(e, WorkerEvent::Stopped)).await;
    wait_for(&mut events, |e| matches!(e, WorkerEvent::Started { .. })).await;

    let status = supervisor.status();
    assert!(status.running);
    assert_ne!(status.pid, first);
    assert_eq!(status.config.port, new_port);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn non_restart_fields_do_not_restart() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(dir.path(), RUN_FOREVER);
    supervisor.start().await.unwrap();
    let scheduled = supervisor
        .update_config(ConfigUpdate {
            rpc_allow_origin_all: Some(false),
            ..Default::default()
        })
        .unwrap();
    assert!(!scheduled);
    assert!(!supervisor.status().config.rpc_allow_origin_all);
    supervisor.stop().await.unwrap();
}
