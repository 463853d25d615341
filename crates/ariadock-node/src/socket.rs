use crate::handler::{NodeState, error_response, handle_request};
use ariadock::protocol::{MAX_LINE_BYTES, Request, Response};
use ariadock_engine::locator::ensure_private_dir;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Accept daemon clients on `socket_path` until the listener fails.
pub async fn serve(state: Arc<NodeState>, socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        ensure_private_dir(parent)?;
    }

    // Remove stale socket
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }

    tracing::info!(path = %socket_path.display(), "Unix socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(state, stream).await {
                tracing::debug!(err = %e, "client disconnected");
            }
        });
    }
}

async fn handle_client(state: Arc<NodeState>, stream: tokio::net::UnixStream) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let hello = Response::Hello {
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    writer.send(serde_json::to_string(&hello)?).await?;

    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            line = reader.next() => {
                let Some(line) = line else { break };
                let line = line?;
                let resp = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => {
                        let is_shutdown = matches!(req, Request::Shutdown);
                        let resp = handle_request(&state, req).await;
                        if is_shutdown {
                            writer.send(serde_json::to_string(&resp)?).await?;
                            break;
                        }
                        resp
                    }
                    Err(e) => error_response("invalid_request", &e.to_string()),
                };
                writer.send(serde_json::to_string(&resp)?).await?;
            }
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        let resp = Response::Event { event };
                        writer.send(serde_json::to_string(&resp)?).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "client fell behind on events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}
