use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum size of a JSON-lines frame on the Unix socket (4 MiB).
///
/// Task listings carry full file lists, so frames are larger than a typical
/// control message.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Typed enums for wire format safety
// ---------------------------------------------------------------------------

/// Kind of push notification received from the download worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadEventKind {
    Start,
    Pause,
    Stop,
    Complete,
    Error,
    BtComplete,
}

impl fmt::Display for DownloadEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadEventKind::Start => "start",
            DownloadEventKind::Pause => "pause",
            DownloadEventKind::Stop => "stop",
            DownloadEventKind::Complete => "complete",
            DownloadEventKind::Error => "error",
            DownloadEventKind::BtComplete => "bt_complete",
        };
        f.write_str(s)
    }
}

/// Partial worker configuration sent with `UpdateConfig`. Absent fields are
/// left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// An empty string disables the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_rpc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_allow_origin_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<bool>,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from the CLI to the daemon over the Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Get daemon health.
    Health,

    // -- Worker process --
    /// Start the download worker.
    WorkerStart,
    /// Stop the download worker.
    WorkerStop,
    /// Restart the download worker.
    WorkerRestart,
    /// Get worker process status and effective configuration.
    WorkerStatus,
    /// Merge a partial configuration; restarts the worker if required.
    UpdateConfig { patch: ConfigPatch },

    // -- Tasks --
    /// Get the reconciled task view.
    Tasks,
    /// Add a download by URI(s).
    AddUri {
        uris: Vec<String>,
        #[serde(default)]
        options: BTreeMap<String, String>,
    },
    /// Add a download from a base64-encoded torrent file.
    AddTorrent {
        torrent_b64: String,
        #[serde(default)]
        uris: Vec<String>,
        #[serde(default)]
        options: BTreeMap<String, String>,
    },
    /// Pause a single task.
    Pause {
        gid: String,
        #[serde(default)]
        force: bool,
    },
    /// Resume a single task.
    Unpause { gid: String },
    /// Pause every task.
    PauseAll {
        #[serde(default)]
        force: bool,
    },
    /// Resume every task.
    UnpauseAll,
    /// Remove a task, optionally deleting its files.
    Remove {
        gid: String,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        delete_files: bool,
    },
    /// Re-submit an errored task's URIs as a new task.
    Retry { gid: String },
    /// Ask the worker to flush its session file now.
    SaveSession,
    /// Get worker transfer statistics.
    GlobalStat,
    /// Get worker version.
    Version,
    /// Drop completed, errored and removed tasks from the worker's history.
    PurgeResults,
    /// Get the worker's global options.
    GlobalOptions,
    /// Change worker global options at runtime (not written to the config
    /// file).
    ChangeGlobalOptions { options: BTreeMap<String, String> },

    // -- Daemon lifecycle --
    /// Shut down the daemon.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Connection established.
    Hello { version: String },
    /// Request succeeded with optional data.
    Ok { data: Option<serde_json::Value> },
    /// Request failed.
    Error { code: String, message: String },
    /// Asynchronous event.
    Event { event: Event },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Asynchronous events pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// Worker process is up.
    WorkerStarted { pid: u32 },
    /// Worker process exited.
    WorkerExited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Worker was stopped on request.
    WorkerStopped,
    /// An automatic restart was scheduled after a crash.
    RestartScheduled { attempt: u32, delay_ms: u64 },
    /// The crash-restart ceiling was reached; manual intervention needed.
    RetriesExhausted { attempts: u32 },
    /// A configuration change scheduled a restart.
    ConfigRestartScheduled,
    /// Download state change pushed by the worker.
    Download { change: DownloadEventKind, gid: String },
}

// ---------------------------------------------------------------------------
// Data types returned in Ok.data
// ---------------------------------------------------------------------------

/// Structured outcome of a worker lifecycle operation.
///
/// Lifecycle failures are reported here rather than as `Response::Error` so
/// that the caller can decide whether to continue degraded or abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl WorkerOpResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            code: None,
            retryable: false,
        }
    }
}

/// Result of an `UpdateConfig` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdateResult {
    pub restart_scheduled: bool,
}

/// GID returned by add and retry requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedTask {
    pub gid: String,
}

/// Daemon health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub worker_running: bool,
    pub active_count: usize,
    pub waiting_count: usize,
    pub stopped_count: usize,
}
