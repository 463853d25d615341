//! Task snapshots as reported by the worker.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Worker-side task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// States where the worker still holds the task as pending work. These
    /// need a strong removal.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            TaskStatus::Active | TaskStatus::Waiting | TaskStatus::Paused | TaskStatus::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUri {
    pub uri: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFile {
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub selected: String,
    #[serde(default)]
    pub uris: Vec<TaskUri>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtInfoName {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<BtInfoName>,
}

/// One download task. Numeric fields stay as the decimal strings the worker
/// sends; accessors parse them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub gid: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub total_length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub download_speed: String,
    #[serde(default)]
    pub upload_speed: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub files: Vec<TaskFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bittorrent: Option<BtInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Fields we do not interpret, kept so persisted snapshots stay complete.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn parse_len(s: &str) -> u64 {
    s.parse().unwrap_or(0)
}

impl Task {
    /// Minimal task for tests and fakes.
    pub fn new(gid: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            gid: gid.into(),
            status,
            total_length: String::new(),
            completed_length: String::new(),
            download_speed: String::new(),
            upload_speed: String::new(),
            dir: String::new(),
            files: Vec::new(),
            bittorrent: None,
            error_code: None,
            error_message: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn total_length(&self) -> u64 {
        parse_len(&self.total_length)
    }

    pub fn completed_length(&self) -> u64 {
        parse_len(&self.completed_length)
    }

    pub fn download_speed(&self) -> u64 {
        parse_len(&self.download_speed)
    }

    /// Torrent name, else the first file's base name, else `Task <gid>`.
    pub fn display_name(&self) -> String {
        if let Some(name) = self
            .bittorrent
            .as_ref()
            .and_then(|bt| bt.info.as_ref())
            .map(|info| info.name.trim())
            .filter(|name| !name.is_empty())
        {
            return name.to_string();
        }
        if let Some(name) = self.files.first().and_then(|f| {
            let base = f.path.rsplit(['/', '\\']).next().unwrap_or("");
            if base.is_empty() {
                f.uris
                    .first()
                    .and_then(|u| u.uri.rsplit('/').next())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            } else {
                Some(base.to_string())
            }
        }) {
            return name;
        }
        format!("Task {}", self.gid)
    }

    /// Distinct source URIs across all files, in first-seen order.
    pub fn source_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = Vec::new();
        for file in &self.files {
            for u in &file.uris {
                if !u.uri.is_empty() && !uris.contains(&u.uri) {
                    uris.push(u.uri.clone());
                }
            }
        }
        uris
    }

    /// Absolute paths of the task's files plus their `.aria2` control files.
    /// Relative paths are resolved against the task directory.
    pub fn file_paths_for_deletion(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for file in &self.files {
            if file.path.is_empty() {
                continue;
            }
            let raw = Path::new(&file.path);
            let path = if raw.is_absolute() || self.dir.is_empty() {
                raw.to_path_buf()
            } else {
                Path::new(&self.dir).join(raw)
            };
            let mut control = path.clone().into_os_string();
            control.push(".aria2");
            paths.push(path);
            paths.push(PathBuf::from(control));
        }
        paths
    }
}

/// One poll's view of the worker's three task lists.
#[derive(Debug, Clone, Default)]
pub struct TaskLists {
    pub active: Vec<Task>,
    pub waiting: Vec<Task>,
    pub stopped: Vec<Task>,
}
