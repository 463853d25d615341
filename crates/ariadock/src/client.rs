use crate::protocol::{Event, MAX_LINE_BYTES, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Client for the ariadock daemon's Unix socket API.
pub struct NodeClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    daemon_version: String,
}

impl NodeClient {
    /// Connect to the daemon at the given socket path.
    /// Waits for the Hello response before returning.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (r, w) = stream.into_split();
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut client = Self {
            reader,
            writer,
            daemon_version: String::new(),
        };

        match client.next_response().await? {
            Response::Hello { version } => {
                client.daemon_version = version;
                Ok(client)
            }
            other => Err(anyhow!("expected Hello, got {other:?}")),
        }
    }

    /// Version string reported by the daemon in its Hello.
    pub fn daemon_version(&self) -> &str {
        &self.daemon_version
    }

    /// Send a request to the daemon.
    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Read the next response from the daemon.
    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("daemon disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send a request and wait for the Ok/Error response, skipping events.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Hello { .. } | Response::Event { .. } => continue,
                Response::Ok { data } => return Ok(data),
                Response::Error { code, message } => bail!("{message} ({code})"),
            }
        }
    }

    /// Wait for the next pushed event, skipping any stray responses.
    /// Returns `None` once the daemon disconnects.
    pub async fn next_event(&mut self) -> Option<Result<Event>> {
        loop {
            let line = match self.reader.next().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            match serde_json::from_str::<Response>(&line) {
                Ok(Response::Event { event }) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Discover the default socket path.
///
/// Checks `$ARIADOCK_SOCKET` env, then falls back to
/// `$XDG_RUNTIME_DIR/ariadock/ariadock.sock` or `/tmp/ariadock-$UID/ariadock.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var(crate::SOCKET_ENV) {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join("ariadock")
            .join("ariadock.sock");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/ariadock-{uid}/ariadock.sock"))
}
