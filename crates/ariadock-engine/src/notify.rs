//! Push notifications from the worker over its WebSocket channel.

use crate::rpc::RpcClient;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadChange {
    Start,
    Pause,
    Stop,
    Complete,
    Error,
    BtComplete,
}

impl DownloadChange {
    fn from_method(method: &str) -> Option<Self> {
        Some(match method {
            "aria2.onDownloadStart" => DownloadChange::Start,
            "aria2.onDownloadPause" => DownloadChange::Pause,
            "aria2.onDownloadStop" => DownloadChange::Stop,
            "aria2.onDownloadComplete" => DownloadChange::Complete,
            "aria2.onDownloadError" => DownloadChange::Error,
            "aria2.onBtDownloadComplete" => DownloadChange::BtComplete,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerNotification {
    pub change: DownloadChange,
    pub gid: String,
}

#[derive(Deserialize)]
struct RawNotification {
    method: String,
    #[serde(default)]
    params: Vec<GidParam>,
}

#[derive(Deserialize)]
struct GidParam {
    gid: String,
}

/// Decode one text frame. Replies to calls and unknown methods yield nothing.
pub fn parse_notification(text: &str) -> Vec<WorkerNotification> {
    let Ok(raw) = serde_json::from_str::<RawNotification>(text) else {
        return Vec::new();
    };
    let Some(change) = DownloadChange::from_method(&raw.method) else {
        return Vec::new();
    };
    raw.params
        .into_iter()
        .map(|p| WorkerNotification { change, gid: p.gid })
        .collect()
}

/// Keep a notification connection open while `cancel` is not triggered,
/// reconnecting with capped backoff. The endpoint is re-read on every attempt
/// so a restart on a new port is picked up.
pub fn spawn_listener(
    rpc: Arc<RpcClient>,
    tx: broadcast::Sender<WorkerNotification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let url = rpc.endpoint().ws_url();
            let session = async {
                match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        tracing::debug!(%url, "notification channel connected");
                        Some(pump(ws, &tx).await)
                    }
                    Err(e) => {
                        tracing::trace!(%url, err = %e, "notification channel unavailable");
                        None
                    }
                }
            };
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = session => outcome,
            };
            if let Some(received) = connected
                && received > 0
            {
                backoff = INITIAL_BACKOFF;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}

/// Forward notifications until the socket closes. Returns how many frames
/// were received.
async fn pump<S>(mut ws: S, tx: &broadcast::Sender<WorkerNotification>) -> usize
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut received = 0;
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                received += 1;
                for note in parse_notification(&text) {
                    tracing::debug!(gid = %note.gid, change = ?note.change, "worker notification");
                    let _ = tx.send(note);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(err = %e, "notification channel error");
                break;
            }
        }
    }
    received
}
