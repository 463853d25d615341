mod handler;
mod socket;

use anyhow::{Context, Result};
use ariadock::client::default_socket_path;
use ariadock::protocol::{DownloadEventKind, Event};
use ariadock_engine::config::ConfigStore;
use ariadock_engine::files::LocalFs;
use ariadock_engine::locator::{ResourceLocator, default_state_dir};
use ariadock_engine::notify::{self, DownloadChange, WorkerNotification};
use ariadock_engine::reconcile::Reconciler;
use ariadock_engine::records::{PersistedTaskStore, TaskTimeStore};
use ariadock_engine::rpc::{RpcClient, RpcEndpoint};
use ariadock_engine::session::{SaveOutcome, SessionSaveCoordinator};
use ariadock_engine::supervisor::{
    ConfigUpdate, Supervisor, SupervisorTimings, WorkerEvent, WorkerProcessConfig,
};
use ariadock_engine::time::SystemClock;
use clap::Parser;
use handler::NodeState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_RPC_PORT: u16 = 6800;
const FINAL_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "ariadock download worker daemon")]
struct Args {
    /// Path to the Unix socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// State directory for worker config, session and task records.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Worker executable (defaults to $ARIADOCK_WORKER_BIN, the bundled copy, then PATH).
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Worker config file (defaults to <state-dir>/aria2/aria2.conf).
    #[arg(long)]
    worker_config: Option<PathBuf>,

    /// RPC port for the worker; written to the config file.
    #[arg(long)]
    port: Option<u16>,

    /// RPC secret for the worker; an empty value disables it.
    #[arg(long)]
    secret: Option<String>,

    /// Download directory; written to the config file.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Do not start the worker at launch or restart it after crashes.
    #[arg(long)]
    no_auto_start: bool,

    /// Task list polling interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Exit instead of running degraded when the worker fails to start.
    #[arg(long)]
    exit_on_start_failure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ariadock_node=info,ariadock_engine=info".into()),
        )
        .init();

    let args = Args::parse();

    let state_dir = match args.state_dir.clone() {
        Some(dir) => dir,
        None => default_state_dir().context("failed to determine state directory")?,
    };
    let socket_path = args.socket.clone().unwrap_or_else(default_socket_path);

    let locator = ResourceLocator::new(state_dir)
        .with_executable(args.executable.clone())
        .with_config_file(args.worker_config.clone());
    locator.prepare().context("failed to prepare state directory")?;

    let worker_config = initial_worker_config(&locator, &args)?;
    tracing::info!(
        exe = %worker_config.executable.display(),
        config = %worker_config.config_file.display(),
        port = worker_config.port,
        "worker configuration loaded"
    );
    if !locator.executable_available() {
        tracing::warn!(
            exe = %worker_config.executable.display(),
            "worker executable not found"
        );
    }

    let rpc = Arc::new(
        RpcClient::new(RpcEndpoint::local(
            worker_config.port,
            worker_config.secret.clone(),
        ))
        .context("failed to build worker rpc client")?,
    );
    let session = SessionSaveCoordinator::new(rpc.clone());
    let reconciler = Arc::new(Reconciler::new(
        rpc.clone(),
        session.clone(),
        TaskTimeStore::load(&locator.task_times_file()).context("failed to load task times")?,
        PersistedTaskStore::load(&locator.persisted_tasks_file())
            .context("failed to load persisted tasks")?,
        Arc::new(LocalFs),
        Arc::new(SystemClock),
    ));
    let supervisor = Supervisor::new(worker_config, SupervisorTimings::default());

    // Flag overrides go through the supervisor so the config file stays the
    // single source of truth.
    let overrides = ConfigUpdate {
        port: args.port,
        secret: args.secret.clone(),
        download_dir: args.download_dir.clone(),
        ..Default::default()
    };
    supervisor
        .update_config(overrides)
        .context("failed to write worker config")?;

    let state = NodeState::new(supervisor.clone(), reconciler.clone(), session.clone(), rpc);
    state.sync_endpoint();

    spawn_worker_event_forwarder(state.clone());
    let (notify_tx, _) = broadcast::channel(256);
    spawn_notification_forwarder(state.clone(), notify_tx.subscribe());
    let listener = notify::spawn_listener(
        state.rpc.clone(),
        notify_tx,
        state.shutdown.child_token(),
    );

    if supervisor.config().auto_start {
        if let Err(e) = supervisor.start().await {
            if args.exit_on_start_failure {
                return Err(e).context("worker failed to start");
            }
            tracing::error!(code = e.code(), err = %e, "worker failed to start, running degraded");
        }
    } else {
        tracing::info!("auto start disabled, worker not started");
    }

    let poll_cancel = state.shutdown.child_token();
    let poller = reconciler.spawn_poller(Duration::from_millis(args.poll_interval_ms), poll_cancel);

    tokio::select! {
        result = socket::serve(state.clone(), &socket_path) => {
            if let Err(e) = result {
                tracing::error!(err = %format!("{e:#}"), "socket server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = state.shutdown.cancelled() => {}
    }

    state.shutdown.cancel();
    shutdown(&state, poller, listener).await;

    std::fs::remove_file(&socket_path).ok();
    tracing::info!("ariadock-node shut down");
    Ok(())
}

/// Read the worker config file (creating it with defaults) into the
/// supervisor's launch config.
fn initial_worker_config(locator: &ResourceLocator, args: &Args) -> Result<WorkerProcessConfig> {
    let fallback_dir = args
        .download_dir
        .clone()
        .unwrap_or_else(default_download_dir);
    let store = ConfigStore::open_or_create(&locator.config_file(), &fallback_dir)
        .context("failed to open worker config")?;
    let relevant = store.relevant();
    let flag = |value: Option<String>| value.is_none_or(|v| v == "true");

    Ok(WorkerProcessConfig {
        executable: locator.executable(),
        config_file: locator.config_file(),
        session_file: locator.session_file(),
        port: relevant
            .port
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_RPC_PORT),
        secret: relevant.secret.filter(|s| !s.is_empty()),
        download_dir: relevant.dir.map(PathBuf::from).unwrap_or(fallback_dir),
        enable_rpc: flag(relevant.enable_rpc),
        rpc_allow_origin_all: flag(relevant.rpc_allow_origin_all),
        auto_start: !args.no_auto_start,
    })
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(std::env::temp_dir)
}

/// Forward supervisor lifecycle events to socket clients.
fn spawn_worker_event_forwarder(state: Arc<NodeState>) {
    let mut rx = state.supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "worker event forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let event = match event {
                WorkerEvent::Started { pid } => {
                    state.sync_endpoint();
                    state.reconciler.request_poll();
                    Event::WorkerStarted { pid }
                }
                WorkerEvent::Exited(exit) => Event::WorkerExited {
                    code: exit.code,
                    signal: exit.signal,
                },
                WorkerEvent::RestartScheduled { attempt, delay } => Event::RestartScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                },
                WorkerEvent::RetriesExhausted { attempts } => {
                    Event::RetriesExhausted { attempts }
                }
                WorkerEvent::Stopped => Event::WorkerStopped,
                WorkerEvent::ConfigRestartScheduled => Event::ConfigRestartScheduled,
            };
            let _ = state.event_tx.send(event);
        }
    });
}

/// Trigger a reconciliation cycle on every worker notification and forward
/// it to socket clients.
fn spawn_notification_forwarder(
    state: Arc<NodeState>,
    mut rx: broadcast::Receiver<WorkerNotification>,
) {
    tokio::spawn(async move {
        loop {
            let notification = match rx.recv().await {
                Ok(n) => n,
                Err(RecvError::Lagged(_)) => {
                    state.reconciler.request_poll();
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            tracing::debug!(gid = %notification.gid, change = ?notification.change, "worker notification");
            state.reconciler.request_poll();
            let _ = state.event_tx.send(Event::Download {
                change: download_kind(notification.change),
                gid: notification.gid,
            });
        }
    });
}

fn download_kind(change: DownloadChange) -> DownloadEventKind {
    match change {
        DownloadChange::Start => DownloadEventKind::Start,
        DownloadChange::Pause => DownloadEventKind::Pause,
        DownloadChange::Stop => DownloadEventKind::Stop,
        DownloadChange::Complete => DownloadEventKind::Complete,
        DownloadChange::Error => DownloadEventKind::Error,
        DownloadChange::BtComplete => DownloadEventKind::BtComplete,
    }
}

/// Stop polling, flush the worker session, then stop the worker.
async fn shutdown(
    state: &NodeState,
    poller: tokio::task::JoinHandle<()>,
    listener: tokio::task::JoinHandle<()>,
) {
    if let Err(e) = poller.await {
        tracing::warn!(err = %e, "task poller ended abnormally");
    }
    listener.abort();

    if state.supervisor.is_running() {
        match tokio::time::timeout(FINAL_SAVE_TIMEOUT, state.session.force_exit()).await {
            Ok(SaveOutcome::Saved) => tracing::info!("worker session saved"),
            Ok(outcome) => tracing::warn!(?outcome, "final session save did not complete"),
            Err(_) => tracing::warn!("final session save timed out"),
        }
    }

    if let Err(e) = state.supervisor.shutdown().await {
        tracing::error!(err = %e, "failed to stop worker");
    }
}
