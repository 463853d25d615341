pub mod tasks;
pub mod worker;

use ariadock::protocol::{Event, HealthStatus, Request, Response};
use ariadock_engine::RpcError;
use ariadock_engine::reconcile::Reconciler;
use ariadock_engine::rpc::{RpcClient, RpcEndpoint};
use ariadock_engine::session::SessionSaveCoordinator;
use ariadock_engine::supervisor::Supervisor;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Shared daemon state accessible by all client connections.
///
/// Exactly one of each engine component exists per daemon process; they are
/// built in `main` and handed in here.
pub struct NodeState {
    pub supervisor: Arc<Supervisor>,
    pub reconciler: Arc<Reconciler<RpcClient>>,
    pub session: Arc<SessionSaveCoordinator<RpcClient>>,
    pub rpc: Arc<RpcClient>,
    pub event_tx: broadcast::Sender<Event>,
    /// Cancelled by a `Shutdown` request or a signal.
    pub shutdown: CancellationToken,
}

impl NodeState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        reconciler: Arc<Reconciler<RpcClient>>,
        session: Arc<SessionSaveCoordinator<RpcClient>>,
        rpc: Arc<RpcClient>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            supervisor,
            reconciler,
            session,
            rpc,
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Point the RPC client at the port and secret the supervisor launches
    /// the worker with.
    pub fn sync_endpoint(&self) {
        let cfg = self.supervisor.config();
        let endpoint = RpcEndpoint::local(cfg.port, cfg.secret);
        if self.rpc.endpoint() != endpoint {
            tracing::debug!(port = endpoint.port, "worker rpc endpoint updated");
            self.rpc.set_endpoint(endpoint);
        }
    }
}

/// Dispatch a request to the appropriate handler.
pub async fn handle_request(state: &Arc<NodeState>, req: Request) -> Response {
    match req {
        Request::Health => handle_health(state),

        // -- Worker process --
        Request::WorkerStart => worker::handle_start(state).await,
        Request::WorkerStop => worker::handle_stop(state).await,
        Request::WorkerRestart => worker::handle_restart(state).await,
        Request::WorkerStatus => worker::handle_status(state),
        Request::UpdateConfig { patch } => worker::handle_update_config(state, patch),

        // -- Tasks --
        Request::Tasks => tasks::handle_tasks(state),
        Request::AddUri { uris, options } => tasks::handle_add_uri(state, &uris, &options).await,
        Request::AddTorrent {
            torrent_b64,
            uris,
            options,
        } => tasks::handle_add_torrent(state, &torrent_b64, &uris, &options).await,
        Request::Pause { gid, force } => tasks::handle_pause(state, &gid, force).await,
        Request::Unpause { gid } => tasks::handle_unpause(state, &gid).await,
        Request::PauseAll { force } => tasks::handle_pause_all(state, force).await,
        Request::UnpauseAll => tasks::handle_unpause_all(state).await,
        Request::Remove {
            gid,
            force,
            delete_files,
        } => tasks::handle_remove(state, &gid, force, delete_files).await,
        Request::Retry { gid } => tasks::handle_retry(state, &gid).await,
        Request::SaveSession => tasks::handle_save_session(state).await,
        Request::GlobalStat => tasks::handle_global_stat(state).await,
        Request::Version => tasks::handle_version(state).await,
        Request::PurgeResults => tasks::handle_purge_results(state).await,
        Request::GlobalOptions => tasks::handle_global_options(state).await,
        Request::ChangeGlobalOptions { options } => {
            tasks::handle_change_global_options(state, &options).await
        }

        Request::Shutdown => handle_shutdown(state),
    }
}

fn handle_health(state: &Arc<NodeState>) -> Response {
    let view = state.reconciler.view();
    let status = HealthStatus {
        healthy: true,
        worker_running: state.supervisor.is_running(),
        active_count: view.active.len(),
        waiting_count: view.waiting.len(),
        stopped_count: view.stopped.len(),
    };
    data_response(&status)
}

fn handle_shutdown(state: &Arc<NodeState>) -> Response {
    tracing::info!("shutdown requested by client");
    state.shutdown.cancel();
    ok_response(None)
}

pub fn ok_response(data: Option<serde_json::Value>) -> Response {
    Response::Ok { data }
}

pub fn error_response(code: &str, message: &str) -> Response {
    Response::Error {
        code: code.to_string(),
        message: message.to_string(),
    }
}

/// `Ok` carrying `value` serialized as JSON.
pub fn data_response<T: Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => ok_response(Some(data)),
        Err(e) => error_response("internal", &e.to_string()),
    }
}

fn rpc_error_code(err: &RpcError) -> &'static str {
    if err.is_not_found() {
        "not_found"
    } else if err.is_transport() {
        "worker_unavailable"
    } else {
        "worker_error"
    }
}

/// Map a worker RPC failure onto a wire error code.
pub fn rpc_error_response(err: &RpcError) -> Response {
    error_response(rpc_error_code(err), &err.to_string())
}

/// Map an engine failure, classifying it by the RPC error underneath when
/// there is one.
pub fn engine_error_response(err: &anyhow::Error) -> Response {
    let message = format!("{err:#}");
    let code = match err.downcast_ref::<RpcError>() {
        Some(rpc) => rpc_error_code(rpc),
        None if message.contains("not found") => "not_found",
        None => "operation_failed",
    };
    error_response(code, &message)
}
