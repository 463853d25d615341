use thiserror::Error;

/// Why a worker lifecycle operation failed.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("worker executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied launching worker: {0}")]
    PermissionDenied(String),

    #[error("rpc port {0} is already in use")]
    PortInUse(u16),

    #[error("worker did not become ready within {0} ms")]
    StartTimeout(u64),

    #[error("worker exited during startup (code {code:?}, signal {signal:?})")]
    ExitedDuringStart {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("another lifecycle operation is in progress ({0})")]
    Busy(&'static str),

    #[error("failed to stop worker: {0}")]
    StopFailed(String),

    #[error("config file was not confirmed after write: {0}")]
    ConfigSync(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Whether waiting and trying again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupervisorError::PortInUse(_)
                | SupervisorError::StartTimeout(_)
                | SupervisorError::ExitedDuringStart { .. }
                | SupervisorError::Busy(_)
        )
    }

    /// Stable code reported to daemon clients.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::ExecutableNotFound(_) => "executable_not_found",
            SupervisorError::PermissionDenied(_) => "permission_denied",
            SupervisorError::PortInUse(_) => "port_in_use",
            SupervisorError::StartTimeout(_) => "start_timeout",
            SupervisorError::ExitedDuringStart { .. } => "exited_during_start",
            SupervisorError::Busy(_) => "busy",
            SupervisorError::StopFailed(_) => "stop_failed",
            SupervisorError::ConfigSync(_) => "config_sync",
            SupervisorError::Io(_) | SupervisorError::Other(_) => "unknown",
        }
    }

    /// Map a spawn failure onto the fatal setup errors where possible.
    pub(crate) fn from_spawn(err: std::io::Error, executable: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                SupervisorError::ExecutableNotFound(executable.display().to_string())
            }
            std::io::ErrorKind::PermissionDenied => {
                SupervisorError::PermissionDenied(executable.display().to_string())
            }
            _ => SupervisorError::Io(err),
        }
    }
}

/// Failure talking to the worker's RPC interface.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("failed to decode rpc response: {0}")]
    Decode(String),
}

impl RpcError {
    /// The worker no longer knows the GID. Treated as an idempotent no-op by
    /// removal paths.
    pub fn is_not_found(&self) -> bool {
        match self {
            RpcError::Remote { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("not found") || m.contains("no such download")
            }
            _ => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RpcError::Decode(e.to_string())
        } else {
            RpcError::Transport(e.to_string())
        }
    }
}
