use super::{
    NodeState, data_response, engine_error_response, error_response, ok_response,
    rpc_error_response,
};
use ariadock::protocol::{AddedTask, Response};
use ariadock_engine::session::SaveOutcome;
use base64::Engine;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn handle_tasks(state: &Arc<NodeState>) -> Response {
    data_response(&state.reconciler.view())
}

pub async fn handle_add_uri(
    state: &Arc<NodeState>,
    uris: &[String],
    options: &BTreeMap<String, String>,
) -> Response {
    let uris: Vec<String> = uris
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    if uris.is_empty() {
        return error_response("invalid_request", "at least one URI is required");
    }
    match state.reconciler.add_uri(&uris, options).await {
        Ok(gid) => {
            state.reconciler.request_poll();
            data_response(&AddedTask { gid })
        }
        Err(e) => engine_error_response(&e),
    }
}

pub async fn handle_add_torrent(
    state: &Arc<NodeState>,
    torrent_b64: &str,
    uris: &[String],
    options: &BTreeMap<String, String>,
) -> Response {
    match base64::engine::general_purpose::STANDARD.decode(torrent_b64) {
        Ok(bytes) if !bytes.is_empty() => {}
        Ok(_) => return error_response("invalid_request", "torrent payload is empty"),
        Err(e) => {
            return error_response("invalid_request", &format!("torrent is not base64: {e}"));
        }
    }
    match state.reconciler.add_torrent(torrent_b64, uris, options).await {
        Ok(gid) => {
            state.reconciler.request_poll();
            data_response(&AddedTask { gid })
        }
        Err(e) => engine_error_response(&e),
    }
}

pub async fn handle_pause(state: &Arc<NodeState>, gid: &str, force: bool) -> Response {
    match state.reconciler.pause(gid, force).await {
        Ok(()) => ok_response(None),
        Err(e) => engine_error_response(&e),
    }
}

pub async fn handle_unpause(state: &Arc<NodeState>, gid: &str) -> Response {
    match state.reconciler.unpause(gid).await {
        Ok(()) => ok_response(None),
        Err(e) => engine_error_response(&e),
    }
}

pub async fn handle_pause_all(state: &Arc<NodeState>, force: bool) -> Response {
    let result = if force {
        state.rpc.force_pause_all().await
    } else {
        state.rpc.pause_all().await
    };
    match result {
        Ok(()) => {
            state.reconciler.request_poll();
            ok_response(None)
        }
        Err(e) => rpc_error_response(&e),
    }
}

pub async fn handle_unpause_all(state: &Arc<NodeState>) -> Response {
    match state.rpc.unpause_all().await {
        Ok(()) => {
            state.reconciler.request_poll();
            ok_response(None)
        }
        Err(e) => rpc_error_response(&e),
    }
}

pub async fn handle_remove(
    state: &Arc<NodeState>,
    gid: &str,
    force: bool,
    delete_files: bool,
) -> Response {
    match state.reconciler.remove(gid, force, delete_files).await {
        Ok(outcome) => data_response(&outcome),
        Err(e) => engine_error_response(&e),
    }
}

pub async fn handle_retry(state: &Arc<NodeState>, gid: &str) -> Response {
    match state.reconciler.retry(gid).await {
        Ok(gid) => {
            state.reconciler.request_poll();
            data_response(&AddedTask { gid })
        }
        Err(e) => engine_error_response(&e),
    }
}

pub async fn handle_save_session(state: &Arc<NodeState>) -> Response {
    let outcome = match state.session.save_immediate().await {
        SaveOutcome::Saved => "saved",
        SaveOutcome::Skipped => "skipped",
        // Save failures are warnings; the worker's own interval save still runs.
        SaveOutcome::Failed => "failed",
    };
    ok_response(Some(serde_json::json!({ "outcome": outcome })))
}

pub async fn handle_global_stat(state: &Arc<NodeState>) -> Response {
    match state.rpc.get_global_stat().await {
        Ok(stat) => data_response(&stat),
        Err(e) => rpc_error_response(&e),
    }
}

pub async fn handle_version(state: &Arc<NodeState>) -> Response {
    match state.rpc.get_version().await {
        Ok(version) => data_response(&version),
        Err(e) => rpc_error_response(&e),
    }
}

pub async fn handle_purge_results(state: &Arc<NodeState>) -> Response {
    match state.rpc.purge_download_result().await {
        Ok(()) => {
            state.reconciler.request_poll();
            ok_response(None)
        }
        Err(e) => rpc_error_response(&e),
    }
}

pub async fn handle_global_options(state: &Arc<NodeState>) -> Response {
    match state.rpc.get_global_option().await {
        Ok(options) => data_response(&options),
        Err(e) => rpc_error_response(&e),
    }
}

pub async fn handle_change_global_options(
    state: &Arc<NodeState>,
    options: &BTreeMap<String, String>,
) -> Response {
    if options.is_empty() {
        return error_response("invalid_request", "no options given");
    }
    if let Some(key) = options.keys().find(|k| k.trim().is_empty()) {
        return error_response("invalid_request", &format!("invalid option key {key:?}"));
    }
    match state.rpc.change_global_option(options).await {
        Ok(()) => {
            tracing::info!(keys = ?options.keys().collect::<Vec<_>>(), "worker global options changed");
            ok_response(None)
        }
        Err(e) => rpc_error_response(&e),
    }
}
