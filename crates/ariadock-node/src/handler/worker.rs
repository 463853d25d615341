use super::{NodeState, data_response, error_response};
use ariadock::protocol::{ConfigPatch, ConfigUpdateResult, Response, WorkerOpResult};
use ariadock_engine::SupervisorError;
use ariadock_engine::supervisor::ConfigUpdate;
use std::path::PathBuf;
use std::sync::Arc;

fn op_result(result: Result<(), SupervisorError>) -> WorkerOpResult {
    match result {
        Ok(()) => WorkerOpResult::ok(),
        Err(e) => WorkerOpResult {
            success: false,
            message: Some(e.to_string()),
            code: Some(e.code().to_string()),
            retryable: e.is_retryable(),
        },
    }
}

pub async fn handle_start(state: &Arc<NodeState>) -> Response {
    state.sync_endpoint();
    let result = state.supervisor.start().await;
    if let Err(e) = &result {
        tracing::warn!(err = %e, "worker start failed");
    }
    data_response(&op_result(result))
}

pub async fn handle_stop(state: &Arc<NodeState>) -> Response {
    let result = state.supervisor.stop().await;
    if let Err(e) = &result {
        tracing::warn!(err = %e, "worker stop failed");
    }
    data_response(&op_result(result))
}

pub async fn handle_restart(state: &Arc<NodeState>) -> Response {
    state.sync_endpoint();
    let result = state.supervisor.restart().await;
    if let Err(e) = &result {
        tracing::warn!(err = %e, "worker restart failed");
    }
    data_response(&op_result(result))
}

pub fn handle_status(state: &Arc<NodeState>) -> Response {
    data_response(&state.supervisor.status())
}

pub fn handle_update_config(state: &Arc<NodeState>, patch: ConfigPatch) -> Response {
    if patch.port == Some(0) {
        return error_response("invalid_request", "port must be non-zero");
    }
    if patch.download_dir.as_deref().is_some_and(|d| d.trim().is_empty()) {
        return error_response("invalid_request", "download dir must not be empty");
    }

    let update = ConfigUpdate {
        port: patch.port,
        secret: patch.secret,
        download_dir: patch.download_dir.map(PathBuf::from),
        enable_rpc: patch.enable_rpc,
        rpc_allow_origin_all: patch.rpc_allow_origin_all,
        auto_start: patch.auto_start,
    };
    match state.supervisor.update_config(update) {
        Ok(restart_scheduled) => {
            // A running worker keeps its old endpoint until the restart.
            if !state.supervisor.is_running() {
                state.sync_endpoint();
            }
            data_response(&ConfigUpdateResult { restart_scheduled })
        }
        Err(e) => error_response(e.code(), &e.to_string()),
    }
}
