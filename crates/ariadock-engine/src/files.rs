use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeletionOutcome {
    Deleted,
    Missing,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathDeletion {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: DeletionOutcome,
}

/// Filesystem operations used when removing tasks.
pub trait FileSystem: Send + Sync {
    /// Delete each path (file or directory tree), independently.
    fn delete_paths(&self, paths: &[PathBuf]) -> Vec<PathDeletion>;

    fn exists(&self, path: &Path) -> bool;
}

/// The local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn delete_paths(&self, paths: &[PathBuf]) -> Vec<PathDeletion> {
        paths
            .iter()
            .map(|path| {
                let result = match std::fs::symlink_metadata(path) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return PathDeletion {
                            path: path.clone(),
                            outcome: DeletionOutcome::Missing,
                        };
                    }
                    Err(e) => Err(e),
                    Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
                    Ok(_) => std::fs::remove_file(path),
                };
                let outcome = match result {
                    Ok(()) => DeletionOutcome::Deleted,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), err = %e, "failed to delete file");
                        DeletionOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                PathDeletion {
                    path: path.clone(),
                    outcome,
                }
            })
            .collect()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
