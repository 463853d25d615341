//! Durable per-task records, one JSON table per file, rewritten in full on
//! every save. `apply_*` methods mutate in memory only so a caller can stage
//! several changes and save once.

use crate::task::Task;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Records older than this are dropped by the retention sweep.
pub const RETENTION_MS: u64 = 30 * DAY_MS;
/// Upper bound on persisted completed tasks.
pub const MAX_PERSISTED_TASKS: usize = 1000;

fn load_table<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&data).with_context(|| format!("invalid {}", path.display()))
}

fn save_table<T: Serialize>(path: &Path, table: &BTreeMap<String, T>) -> Result<()> {
    let data = serde_json::to_string_pretty(table)?;
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
}

/// Write-once add and complete timestamps for one GID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TaskTimeRecord {
    fn reference_time(&self) -> Option<u64> {
        self.complete_time_ms.or(self.add_time_ms)
    }
}

/// `task_times.json`: GID -> [`TaskTimeRecord`].
#[derive(Clone)]
pub struct TaskTimeStore {
    path: PathBuf,
    records: BTreeMap<String, TaskTimeRecord>,
}

impl TaskTimeStore {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            records: load_table(path)?,
        })
    }

    pub fn get(&self, gid: &str) -> Option<&TaskTimeRecord> {
        self.records.get(gid)
    }

    pub fn complete_time(&self, gid: &str) -> Option<u64> {
        self.records.get(gid).and_then(|r| r.complete_time_ms)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        save_table(&self.path, &self.records)
    }

    /// Record add times for GIDs that have none and save. Existing add times
    /// are never replaced; a missing name is filled in. Returns how many
    /// changed.
    pub fn record_adds<'a, I>(&mut self, entries: I, at_ms: u64) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, Option<String>)>,
    {
        let changed = self.apply_adds(entries, at_ms);
        if changed > 0 {
            self.save()?;
        }
        Ok(changed)
    }

    /// In-memory half of [`record_adds`](Self::record_adds).
    pub fn apply_adds<'a, I>(&mut self, entries: I, at_ms: u64) -> usize
    where
        I: IntoIterator<Item = (&'a str, Option<String>)>,
    {
        let mut changed = 0;
        for (gid, name) in entries {
            let record = self.records.entry(gid.to_string()).or_default();
            let mut touched = false;
            if record.add_time_ms.is_none() {
                record.add_time_ms = Some(at_ms);
                touched = true;
            }
            if record.name.is_none() && name.is_some() {
                record.name = name;
                touched = true;
            }
            if touched {
                changed += 1;
            }
        }
        changed
    }

    /// Set complete times for GIDs that have none, backfilling a missing add
    /// time. In memory only. Returns how many were newly set.
    pub fn apply_completes<'a, I>(&mut self, entries: I, at_ms: u64) -> usize
    where
        I: IntoIterator<Item = (&'a str, Option<String>)>,
    {
        let mut changed = 0;
        for (gid, name) in entries {
            let record = self.records.entry(gid.to_string()).or_default();
            if record.complete_time_ms.is_some() {
                continue;
            }
            record.complete_time_ms = Some(at_ms);
            record.add_time_ms.get_or_insert(at_ms);
            if record.name.is_none() {
                record.name = name;
            }
            changed += 1;
        }
        changed
    }

    pub fn remove(&mut self, gid: &str) -> Result<bool> {
        if self.records.remove(gid).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Drop records older than the retention window, except GIDs in `keep`.
    /// In memory only; the caller saves.
    pub fn sweep(&mut self, now_ms: u64, keep: &HashSet<String>) -> usize {
        let cutoff = now_ms.saturating_sub(RETENTION_MS);
        let before = self.records.len();
        self.records.retain(|gid, r| {
            keep.contains(gid) || r.reference_time().is_none_or(|t| t >= cutoff)
        });
        before - self.records.len()
    }
}

/// A completed task kept after the worker forgets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTaskRecord {
    pub task: Task,
    pub persisted_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl PersistedTaskRecord {
    fn reference_time(&self) -> u64 {
        self.completed_at_ms.unwrap_or(self.persisted_at_ms)
    }
}

/// `persisted_tasks.json`: GID -> [`PersistedTaskRecord`].
#[derive(Clone)]
pub struct PersistedTaskStore {
    path: PathBuf,
    records: BTreeMap<String, PersistedTaskRecord>,
    capacity: usize,
}

impl PersistedTaskStore {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            records: load_table(path)?,
            capacity: MAX_PERSISTED_TASKS,
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn contains(&self, gid: &str) -> bool {
        self.records.contains_key(gid)
    }

    pub fn get(&self, gid: &str) -> Option<&PersistedTaskRecord> {
        self.records.get(gid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PersistedTaskRecord> {
        self.records.values()
    }

    pub fn save(&self) -> Result<()> {
        save_table(&self.path, &self.records)
    }

    /// Snapshot tasks that have no record yet. An existing record is never
    /// replaced, and capacity eviction never drops a GID in `keep`. In memory
    /// only. Returns how many were inserted.
    pub fn apply_new<I>(&mut self, entries: I, now_ms: u64, keep: &HashSet<String>) -> usize
    where
        I: IntoIterator<Item = (Task, u64)>,
    {
        let mut inserted = 0;
        for (task, completed_at) in entries {
            if self.records.contains_key(&task.gid) {
                continue;
            }
            tracing::debug!(gid = %task.gid, completed_at, "persisting completed task");
            self.records.insert(
                task.gid.clone(),
                PersistedTaskRecord {
                    task,
                    persisted_at_ms: now_ms,
                    completed_at_ms: Some(completed_at),
                },
            );
            inserted += 1;
        }
        if inserted > 0 {
            self.evict_over_capacity(keep);
        }
        inserted
    }

    pub fn remove(&mut self, gid: &str) -> Result<bool> {
        if self.records.remove(gid).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Drop records older than the retention window, except GIDs in `keep`.
    /// In memory only; the caller saves.
    pub fn sweep(&mut self, now_ms: u64, keep: &HashSet<String>) -> usize {
        let cutoff = now_ms.saturating_sub(RETENTION_MS);
        let before = self.records.len();
        self.records
            .retain(|gid, r| keep.contains(gid) || r.reference_time() >= cutoff);
        before - self.records.len()
    }

    /// Evict oldest-first down to capacity. GIDs the worker still reports
    /// stay, even if that leaves the table over capacity.
    fn evict_over_capacity(&mut self, keep: &HashSet<String>) {
        let excess = self.records.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(u64, String)> = self
            .records
            .iter()
            .filter(|(gid, _)| !keep.contains(*gid))
            .map(|(gid, r)| (r.reference_time(), gid.clone()))
            .collect();
        by_age.sort();
        let mut evicted = 0;
        for (_, gid) in by_age.into_iter().take(excess) {
            self.records.remove(&gid);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::info!(evicted, "trimmed persisted tasks to capacity");
        }
    }
}
