//! Filesystem layout: state directory, worker executable, config and session
//! files, durable record tables.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const STATE_DIR_ENV: &str = "ARIADOCK_STATE_DIR";
pub const WORKER_BIN_ENV: &str = "ARIADOCK_WORKER_BIN";

const DEFAULT_STATE_DIR: &str = ".local/state/ariadock";
const WORKER_SUBDIR: &str = "aria2";
const RESOURCES_SUBDIR: &str = "resources";
const CONFIG_FILE: &str = "aria2.conf";
const SESSION_FILE: &str = "aria2.session";
const TASK_TIMES_FILE: &str = "task_times.json";
const PERSISTED_TASKS_FILE: &str = "persisted_tasks.json";

#[cfg(windows)]
const WORKER_BIN_NAME: &str = "aria2c.exe";
#[cfg(not(windows))]
const WORKER_BIN_NAME: &str = "aria2c";

/// `$ARIADOCK_STATE_DIR`, else `~/.local/state/ariadock`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// Create a directory (and parents) restricted to the current user.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Resolved paths for one daemon instance.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    state_dir: PathBuf,
    executable: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

impl ResourceLocator {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            executable: None,
            config_file: None,
        }
    }

    /// Pin the worker executable instead of searching for it.
    pub fn with_executable(mut self, path: Option<PathBuf>) -> Self {
        self.executable = path;
        self
    }

    /// Use a config file outside the state directory.
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn worker_dir(&self) -> PathBuf {
        self.state_dir.join(WORKER_SUBDIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.worker_dir().join(CONFIG_FILE))
    }

    pub fn session_file(&self) -> PathBuf {
        self.worker_dir().join(SESSION_FILE)
    }

    pub fn task_times_file(&self) -> PathBuf {
        self.state_dir.join(TASK_TIMES_FILE)
    }

    pub fn persisted_tasks_file(&self) -> PathBuf {
        self.state_dir.join(PERSISTED_TASKS_FILE)
    }

    /// Worker executable: pinned path, then `$ARIADOCK_WORKER_BIN`, then the
    /// bundled copy under `<state>/resources`, then `PATH`.
    ///
    /// Falls back to the pinned or bundled path even when it does not exist so
    /// callers get a concrete path to report.
    pub fn executable(&self) -> PathBuf {
        if let Some(path) = &self.executable {
            return path.clone();
        }
        if let Ok(path) = std::env::var(WORKER_BIN_ENV)
            && !path.is_empty()
        {
            return PathBuf::from(path);
        }
        let bundled = self.state_dir.join(RESOURCES_SUBDIR).join(WORKER_BIN_NAME);
        if bundled.is_file() {
            return bundled;
        }
        search_path(WORKER_BIN_NAME).unwrap_or(bundled)
    }

    pub fn executable_available(&self) -> bool {
        self.executable().is_file()
    }

    /// Create the state and worker directories and an empty session file.
    pub fn prepare(&self) -> Result<()> {
        ensure_private_dir(&self.state_dir)?;
        let worker_dir = self.worker_dir();
        std::fs::create_dir_all(&worker_dir)
            .with_context(|| format!("failed to create {}", worker_dir.display()))?;
        let session = self.session_file();
        if !session.exists() {
            std::fs::write(&session, b"")
                .with_context(|| format!("failed to create {}", session.display()))?;
        }
        Ok(())
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
