//! Task reconciliation: merges the worker's live lists with the durable
//! records so finished tasks outlive the worker's own history.
//!
//! Each cycle fetches the three worker lists, diffs them against the previous
//! cycle's [`Snapshot`], commits write-once timestamps and completed-task
//! snapshots, then publishes a merged [`TaskView`]. A cycle either completes
//! all of its reads or is discarded whole.

use crate::files::{FileSystem, PathDeletion};
use crate::records::{DAY_MS, PersistedTaskStore, TaskTimeStore};
use crate::rpc::{LIST_PAGE, WorkerApi};
use crate::session::SessionSaveCoordinator;
use crate::task::{Task, TaskLists, TaskStatus};
use crate::time::Clock;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay after pause/unpause before re-polling; the worker acknowledges the
/// call before the status actually flips.
pub const STATUS_SETTLE: Duration = Duration::from_millis(200);
/// Completion time assumed for completed tasks found with no history.
pub const UNKNOWN_COMPLETION_BACKDATE_MS: u64 = DAY_MS;
const SWEEP_INTERVAL_MS: u64 = DAY_MS;

/// GID sets from one cycle. `observed` is false before the first successful
/// cycle, when nothing can be called "newly" seen.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    observed: bool,
    live: HashSet<String>,
    stopped: HashSet<String>,
}

impl Snapshot {
    pub fn from_lists(lists: &TaskLists) -> Self {
        Self {
            observed: true,
            live: lists
                .active
                .iter()
                .chain(&lists.waiting)
                .map(|t| t.gid.clone())
                .collect(),
            stopped: lists.stopped.iter().map(|t| t.gid.clone()).collect(),
        }
    }

    pub fn contains(&self, gid: &str) -> bool {
        self.live.contains(gid) || self.stopped.contains(gid)
    }
}

/// Record writes one cycle needs. Produced without touching storage.
#[derive(Debug, Default)]
pub struct CyclePlan {
    pub add_times: Vec<(String, Option<String>)>,
    pub complete_times: Vec<(String, Option<String>)>,
    pub persist: Vec<(Task, u64)>,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.add_times.is_empty() && self.complete_times.is_empty() && self.persist.is_empty()
    }
}

/// Decide what the cycle must write, given the previous snapshot and the
/// freshly fetched lists.
pub fn plan_cycle(
    prev: &Snapshot,
    lists: &TaskLists,
    times: &TaskTimeStore,
    persisted: &PersistedTaskStore,
    now_ms: u64,
) -> CyclePlan {
    let mut plan = CyclePlan::default();

    for task in lists.active.iter().chain(&lists.waiting) {
        if !prev.live.contains(&task.gid)
            && times.get(&task.gid).is_none_or(|r| r.add_time_ms.is_none())
        {
            plan.add_times
                .push((task.gid.clone(), Some(task.display_name())));
        }
    }

    for task in lists
        .stopped
        .iter()
        .filter(|t| t.status == TaskStatus::Complete)
    {
        let newly_complete = prev.observed && !prev.stopped.contains(&task.gid);
        let recorded = times.complete_time(&task.gid);

        if newly_complete && recorded.is_none() {
            plan.complete_times
                .push((task.gid.clone(), Some(task.display_name())));
        }
        if persisted.contains(&task.gid) {
            continue;
        }
        let completed_at = match recorded {
            Some(at) => at,
            None if newly_complete => now_ms,
            None => {
                let estimate = now_ms.saturating_sub(UNKNOWN_COMPLETION_BACKDATE_MS);
                // Never before the recorded add time.
                times
                    .get(&task.gid)
                    .and_then(|r| r.add_time_ms)
                    .map_or(estimate, |added| estimate.max(added.min(now_ms)))
            }
        };
        plan.persist.push((task.clone(), completed_at));
    }

    plan
}

/// A task as presented to clients.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEntry {
    #[serde(flatten)]
    pub task: Task,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    /// Served from the durable record rather than the worker.
    pub archived: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskView {
    /// Worker active tasks followed by errored tasks awaiting retry.
    pub active: Vec<TaskEntry>,
    pub waiting: Vec<TaskEntry>,
    /// Worker stopped tasks (errors excluded) plus archived completions.
    pub stopped: Vec<TaskEntry>,
}

impl TaskView {
    pub fn contains(&self, gid: &str) -> bool {
        self.active
            .iter()
            .chain(&self.waiting)
            .chain(&self.stopped)
            .any(|e| e.task.gid == gid)
    }

    fn forget(&mut self, gid: &str) {
        for list in [&mut self.active, &mut self.waiting, &mut self.stopped] {
            list.retain(|e| e.task.gid != gid);
        }
    }
}

fn entry(task: &Task, times: &TaskTimeStore, archived: bool) -> TaskEntry {
    let record = times.get(&task.gid);
    TaskEntry {
        name: record
            .and_then(|r| r.name.clone())
            .unwrap_or_else(|| task.display_name()),
        added_at_ms: record.and_then(|r| r.add_time_ms),
        completed_at_ms: record.and_then(|r| r.complete_time_ms),
        task: task.clone(),
        archived,
    }
}

/// Build the client view: worker state wins, persisted copies fill in what
/// the worker has purged.
pub fn merge_view(
    lists: &TaskLists,
    times: &TaskTimeStore,
    persisted: &PersistedTaskStore,
) -> TaskView {
    let (errors, stopped): (Vec<&Task>, Vec<&Task>) = lists
        .stopped
        .iter()
        .partition(|t| t.status == TaskStatus::Error);

    let worker_stopped: HashSet<&str> = lists.stopped.iter().map(|t| t.gid.as_str()).collect();
    let mut archived: Vec<_> = persisted
        .records()
        .filter(|r| !worker_stopped.contains(r.task.gid.as_str()))
        .collect();
    archived.sort_by_key(|r| std::cmp::Reverse(r.completed_at_ms.unwrap_or(r.persisted_at_ms)));

    TaskView {
        active: lists
            .active
            .iter()
            .chain(errors)
            .map(|t| entry(t, times, false))
            .collect(),
        waiting: lists.waiting.iter().map(|t| entry(t, times, false)).collect(),
        stopped: stopped
            .into_iter()
            .map(|t| entry(t, times, false))
            .chain(archived.into_iter().map(|r| {
                let mut e = entry(&r.task, times, true);
                e.completed_at_ms = e.completed_at_ms.or(r.completed_at_ms);
                e
            }))
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Applied { persisted: usize },
    /// Another cycle held the single-flight guard.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveOutcome {
    pub gid: String,
    /// False when the task only existed in the durable records.
    pub worker_contacted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_files: Vec<PathDeletion>,
}

struct Records {
    times: TaskTimeStore,
    persisted: PersistedTaskStore,
    snapshot: Snapshot,
    last_sweep_ms: Option<u64>,
}

pub struct Reconciler<W> {
    worker: Arc<W>,
    session: Arc<SessionSaveCoordinator<W>>,
    files: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    records: Mutex<Records>,
    view: RwLock<TaskView>,
    /// Held for the duration of a cycle or a removal.
    flight: Mutex<()>,
    wake: Notify,
    settle: Duration,
}

impl<W: WorkerApi + 'static> Reconciler<W> {
    pub fn new(
        worker: Arc<W>,
        session: Arc<SessionSaveCoordinator<W>>,
        times: TaskTimeStore,
        persisted: PersistedTaskStore,
        files: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker,
            session,
            files,
            clock,
            records: Mutex::new(Records {
                times,
                persisted,
                snapshot: Snapshot::default(),
                last_sweep_ms: None,
            }),
            view: RwLock::new(TaskView::default()),
            flight: Mutex::new(()),
            wake: Notify::new(),
            settle: STATUS_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The last published view.
    pub fn view(&self) -> TaskView {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wake the poller for an immediate cycle.
    pub fn request_poll(&self) {
        self.wake.notify_one();
    }

    async fn fetch(&self) -> Result<TaskLists> {
        let (active, waiting, stopped) = tokio::try_join!(
            self.worker.tell_active(),
            self.worker.tell_waiting(0, LIST_PAGE),
            self.worker.tell_stopped(0, LIST_PAGE),
        )
        .context("failed to fetch task lists")?;
        Ok(TaskLists {
            active,
            waiting,
            stopped,
        })
    }

    /// Run one cycle unless one is already running.
    pub async fn poll_once(&self) -> Result<CycleOutcome> {
        let Ok(_flight) = self.flight.try_lock() else {
            return Ok(CycleOutcome::Skipped);
        };
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> Result<CycleOutcome> {
        let lists = self.fetch().await?;
        let now = self.clock.now_ms();

        let mut records = self.records.lock().await;
        let plan = plan_cycle(
            &records.snapshot,
            &lists,
            &records.times,
            &records.persisted,
            now,
        );
        let reported: HashSet<String> = lists
            .active
            .iter()
            .chain(&lists.waiting)
            .chain(&lists.stopped)
            .map(|t| t.gid.clone())
            .collect();

        let sweep_due = records
            .last_sweep_ms
            .is_none_or(|last| now.saturating_sub(last) >= SWEEP_INTERVAL_MS);
        let mut persisted = 0;
        if sweep_due || !plan.is_empty() {
            // Stage every mutation on copies. Each table is swapped in only
            // after its file is written, so memory never runs ahead of disk,
            // and a failed write discards the rest of the cycle.
            let mut times = records.times.clone();
            let mut archive = records.persisted.clone();
            let mut times_changed = times
                .apply_adds(plan.add_times.iter().map(|(g, n)| (g.as_str(), n.clone())), now)
                + times.apply_completes(
                    plan.complete_times
                        .iter()
                        .map(|(g, n)| (g.as_str(), n.clone())),
                    now,
                );
            persisted = archive.apply_new(plan.persist, now, &reported);
            let mut archive_changed = persisted;

            if sweep_due {
                let dropped_times = times.sweep(now, &reported);
                let dropped_archive = archive.sweep(now, &reported);
                if dropped_times + dropped_archive > 0 {
                    tracing::info!(
                        swept = dropped_times + dropped_archive,
                        "dropped expired task records"
                    );
                }
                times_changed += dropped_times;
                archive_changed += dropped_archive;
            }

            if times_changed > 0 {
                times.save()?;
            }
            records.times = times;
            if archive_changed > 0 {
                archive.save()?;
            }
            records.persisted = archive;
            if sweep_due {
                records.last_sweep_ms = Some(now);
            }
            if persisted > 0 {
                tracing::info!(count = persisted, "archived completed tasks");
            }
        }

        let view = merge_view(&lists, &records.times, &records.persisted);
        records.snapshot = Snapshot::from_lists(&lists);
        drop(records);

        *self.view.write().unwrap_or_else(|e| e.into_inner()) = view;
        Ok(CycleOutcome::Applied { persisted })
    }

    /// Poll on `interval` and whenever [`request_poll`](Self::request_poll) is
    /// called, until `cancel` fires. An in-flight cycle always completes.
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = this.wake.notified() => {}
                }
                match this.poll_once().await {
                    Ok(_) => {}
                    Err(e) => tracing::debug!(err = %format!("{e:#}"), "reconciliation cycle skipped"),
                }
            }
            tracing::debug!("task poller stopped");
        })
    }

    /// Add a download by URI and start tracking it.
    pub async fn add_uri(
        &self,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<String> {
        if uris.is_empty() {
            bail!("at least one URI is required");
        }
        let gid = self.worker.add_uri(uris, options).await?;
        let name = uris[0]
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self.track_added(&gid, name).await?;
        Ok(gid)
    }

    pub async fn add_torrent(
        &self,
        torrent_b64: &str,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<String> {
        let gid = self.worker.add_torrent(torrent_b64, uris, options).await?;
        self.track_added(&gid, None).await?;
        Ok(gid)
    }

    async fn track_added(&self, gid: &str, name: Option<String>) -> Result<()> {
        let now = self.clock.now_ms();
        self.records
            .lock()
            .await
            .times
            .record_adds([(gid, name)], now)?;
        tracing::info!(gid = %gid, "task added");
        self.session.mark_for_save(gid);
        Ok(())
    }

    /// Pause one task; `force` skips the worker's graceful pause.
    pub async fn pause(&self, gid: &str, force: bool) -> Result<()> {
        if force {
            self.worker.force_pause(gid).await?;
        } else {
            self.worker.pause(gid).await?;
        }
        self.session.mark_for_save(gid);
        self.settle_and_poll().await;
        Ok(())
    }

    pub async fn unpause(&self, gid: &str) -> Result<()> {
        self.worker.unpause(gid).await?;
        self.session.mark_for_save(gid);
        self.settle_and_poll().await;
        Ok(())
    }

    async fn settle_and_poll(&self) {
        tokio::time::sleep(self.settle).await;
        if let Err(e) = self.poll_once().await {
            tracing::debug!(err = %format!("{e:#}"), "re-poll after status change failed");
        }
    }

    /// Remove a task from the worker and from the durable records.
    pub async fn remove(&self, gid: &str, force: bool, delete_files: bool) -> Result<RemoveOutcome> {
        let _flight = self.flight.lock().await;

        let (known_to_worker, archived) = {
            let records = self.records.lock().await;
            (
                records.snapshot.contains(gid),
                records.persisted.get(gid).map(|r| r.task.clone()),
            )
        };

        let mut outcome = RemoveOutcome {
            gid: gid.to_string(),
            worker_contacted: false,
            deleted_files: Vec::new(),
        };

        let task = if !known_to_worker && archived.is_some() {
            archived
        } else {
            outcome.worker_contacted = true;
            let live = match self.worker.tell_status(gid).await {
                Ok(task) => Some(task),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e).context("failed to look up task"),
            };
            if let Some(task) = &live {
                self.remove_from_worker(task, force).await?;
            }
            live.or(archived)
        };

        if delete_files && let Some(task) = &task {
            outcome.deleted_files = self.files.delete_paths(&task.file_paths_for_deletion());
        }

        {
            let mut records = self.records.lock().await;
            records.times.remove(gid)?;
            records.persisted.remove(gid)?;
        }
        self.view
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .forget(gid);
        if outcome.worker_contacted {
            self.session.mark_for_save(gid);
        }
        tracing::info!(gid = %gid, worker = outcome.worker_contacted, "task removed");
        Ok(outcome)
    }

    async fn remove_from_worker(&self, task: &Task, force: bool) -> Result<()> {
        let gid = task.gid.as_str();
        let strong = force || task.status.is_live();
        let primary = if strong {
            self.worker.force_remove(gid).await
        } else {
            self.worker.remove(gid).await
        };
        match primary {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(gid = %gid, "task already gone from worker");
            }
            // Soft removal of a finished task is refused by some worker
            // versions; the history purge below covers it.
            Err(e @ crate::error::RpcError::Remote { .. }) if !strong => {
                tracing::debug!(gid = %gid, err = %e, "soft removal refused");
            }
            Err(e) => return Err(e).context("failed to remove task from worker"),
        }
        if let Err(e) = self.worker.remove_download_result(gid).await {
            tracing::debug!(gid = %gid, err = %e, "history purge failed");
        }
        Ok(())
    }

    /// Re-submit an errored task's URIs as a new task. Returns the new GID,
    /// which is unrelated to the old one.
    pub async fn retry(&self, gid: &str) -> Result<String> {
        let _flight = self.flight.lock().await;

        let task = match self.worker.tell_status(gid).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                let records = self.records.lock().await;
                match records.persisted.get(gid) {
                    Some(r) => r.task.clone(),
                    None => bail!("task {gid} not found"),
                }
            }
            Err(e) => return Err(e).context("failed to look up task"),
        };

        let uris = task.source_uris();
        if uris.is_empty() {
            bail!("task {gid} has no source URIs to retry");
        }

        if let Err(e) = self.worker.force_remove(gid).await {
            tracing::debug!(gid = %gid, err = %e, "force remove before retry failed");
        }
        if let Err(e) = self.worker.remove_download_result(gid).await {
            tracing::debug!(gid = %gid, err = %e, "history purge before retry failed");
        }
        {
            let mut records = self.records.lock().await;
            records.times.remove(gid)?;
            records.persisted.remove(gid)?;
        }
        self.view
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .forget(gid);

        let mut options = BTreeMap::new();
        if !task.dir.is_empty() {
            options.insert("dir".to_string(), task.dir.clone());
        }
        let new_gid = self
            .worker
            .add_uri(&uris, &options)
            .await
            .context("failed to re-submit task")?;
        self.track_added(&new_gid, Some(task.display_name())).await?;
        tracing::info!(old = %gid, new = %new_gid, "task retried");
        Ok(new_gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeWorker;
    use crate::files::{DeletionOutcome, LocalFs};
    use crate::records::MAX_PERSISTED_TASKS;
    use crate::task::{TaskFile, TaskUri};
    use crate::time::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        worker: Arc<FakeWorker>,
        clock: Arc<ManualClock>,
        reconciler: Reconciler<FakeWorker>,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with_capacity(MAX_PERSISTED_TASKS)
    }

    fn harness_with_capacity(capacity: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let worker = Arc::new(FakeWorker::default());
        let clock = Arc::new(ManualClock::new(T0));
        let reconciler = Reconciler::new(
            worker.clone(),
            SessionSaveCoordinator::new(worker.clone()),
            TaskTimeStore::load(&dir.path().join("task_times.json")).unwrap(),
            PersistedTaskStore::load(&dir.path().join("persisted_tasks.json"))
                .unwrap()
                .with_capacity(capacity),
            Arc::new(LocalFs),
            clock.clone(),
        )
        .with_settle(Duration::ZERO);
        Harness {
            worker,
            clock,
            reconciler,
            dir,
        }
    }

    fn task(gid: &str, status: TaskStatus) -> Task {
        Task::new(gid, status)
    }

    fn gids(entries: &[TaskEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.task.gid.as_str()).collect()
    }

    async fn persisted_record(h: &Harness, gid: &str) -> Option<crate::records::PersistedTaskRecord> {
        h.reconciler
            .records
            .lock()
            .await
            .persisted
            .get(gid)
            .cloned()
    }

    #[tokio::test]
    async fn active_then_complete_persists_once_with_cycle_time() {
        let h = harness();
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();

        h.clock.set(T0 + 5_000);
        h.worker
            .set_lists(vec![], vec![], vec![task("g1", TaskStatus::Complete)]);
        assert_eq!(
            h.reconciler.poll_once().await.unwrap(),
            CycleOutcome::Applied { persisted: 1 }
        );

        for later in 1..4 {
            h.clock.set(T0 + 5_000 + later * 60_000);
            assert_eq!(
                h.reconciler.poll_once().await.unwrap(),
                CycleOutcome::Applied { persisted: 0 }
            );
        }

        let record = persisted_record(&h, "g1").await.unwrap();
        assert_eq!(record.completed_at_ms, Some(T0 + 5_000));
        let records = h.reconciler.records.lock().await;
        let times = records.times.get("g1").unwrap();
        assert_eq!(times.add_time_ms, Some(T0));
        assert_eq!(times.complete_time_ms, Some(T0 + 5_000));
    }

    #[tokio::test]
    async fn recovered_completions_are_backdated() {
        let h = harness();
        h.worker
            .set_lists(vec![], vec![], vec![task("old", TaskStatus::Complete)]);
        h.reconciler.poll_once().await.unwrap();

        let record = persisted_record(&h, "old").await.unwrap();
        assert_eq!(
            record.completed_at_ms,
            Some(T0 - UNKNOWN_COMPLETION_BACKDATE_MS)
        );
        assert_eq!(record.persisted_at_ms, T0);
    }

    #[tokio::test]
    async fn recovered_completion_is_never_before_its_add_time() {
        let h = harness();
        // Added an hour ago, then finished while nothing was polling.
        h.reconciler
            .records
            .lock()
            .await
            .times
            .record_adds([("g1", None)], T0 - 3_600_000)
            .unwrap();
        h.worker
            .set_lists(vec![], vec![], vec![task("g1", TaskStatus::Complete)]);
        h.reconciler.poll_once().await.unwrap();

        let record = persisted_record(&h, "g1").await.unwrap();
        assert_eq!(record.completed_at_ms, Some(T0 - 3_600_000));
    }

    #[tokio::test]
    async fn full_archive_keeps_a_reported_task_once_persisted() {
        let h = harness_with_capacity(2);
        h.reconciler.records.lock().await.persisted.apply_new(
            [
                (task("a", TaskStatus::Complete), T0 - 1_000),
                (task("b", TaskStatus::Complete), T0 - 500),
            ],
            T0 - 500,
            &HashSet::new(),
        );
        h.worker
            .set_lists(vec![], vec![], vec![task("old", TaskStatus::Complete)]);
        assert_eq!(
            h.reconciler.poll_once().await.unwrap(),
            CycleOutcome::Applied { persisted: 1 }
        );
        let first = persisted_record(&h, "old").await.unwrap();
        assert_eq!(
            first.completed_at_ms,
            Some(T0 - UNKNOWN_COMPLETION_BACKDATE_MS)
        );

        for cycle in 1..4 {
            h.clock.set(T0 + cycle * 60_000);
            assert_eq!(
                h.reconciler.poll_once().await.unwrap(),
                CycleOutcome::Applied { persisted: 0 }
            );
            assert_eq!(persisted_record(&h, "old").await.unwrap(), first);
        }

        let records = h.reconciler.records.lock().await;
        assert_eq!(records.persisted.len(), 2);
        assert!(!records.persisted.contains("a"));
        assert!(records.persisted.contains("b"));
    }

    #[tokio::test]
    async fn failed_archive_write_is_retried_next_cycle() {
        let h = harness();
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();

        // A directory where the archive file goes makes the write fail.
        let archive = h.dir.path().join("persisted_tasks.json");
        std::fs::create_dir(&archive).unwrap();
        h.clock.set(T0 + 5_000);
        h.worker
            .set_lists(vec![], vec![], vec![task("g1", TaskStatus::Complete)]);
        assert!(h.reconciler.poll_once().await.is_err());
        assert!(persisted_record(&h, "g1").await.is_none());
        assert!(h.reconciler.view().stopped.is_empty());

        std::fs::remove_dir(&archive).unwrap();
        h.clock.set(T0 + 9_000);
        assert_eq!(
            h.reconciler.poll_once().await.unwrap(),
            CycleOutcome::Applied { persisted: 1 }
        );
        let record = persisted_record(&h, "g1").await.unwrap();
        assert_eq!(record.completed_at_ms, Some(T0 + 5_000));
        let reloaded = PersistedTaskStore::load(&archive).unwrap();
        assert_eq!(reloaded.get("g1").unwrap().completed_at_ms, Some(T0 + 5_000));
    }

    #[tokio::test]
    async fn add_time_is_set_once_across_cycles() {
        let h = harness();
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();

        // Drops out and comes back: still the original add time.
        h.clock.set(T0 + 1_000);
        h.worker.set_lists(vec![], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();
        h.clock.set(T0 + 2_000);
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();

        let records = h.reconciler.records.lock().await;
        assert_eq!(records.times.get("g1").unwrap().add_time_ms, Some(T0));
    }

    #[tokio::test]
    async fn merged_stopped_list_prefers_worker_copy() {
        let h = harness();
        h.worker.set_lists(
            vec![],
            vec![],
            vec![
                task("a", TaskStatus::Complete),
                task("b", TaskStatus::Complete),
            ],
        );
        h.reconciler.poll_once().await.unwrap();

        // Worker purges `a`, still reports `b` (now with a new length), and
        // has an error task.
        let mut b = task("b", TaskStatus::Complete);
        b.total_length = "42".into();
        h.worker.set_lists(
            vec![task("act", TaskStatus::Active)],
            vec![],
            vec![b, task("bad", TaskStatus::Error)],
        );
        h.reconciler.poll_once().await.unwrap();

        let view = h.reconciler.view();
        assert_eq!(gids(&view.active), vec!["act", "bad"]);
        assert_eq!(gids(&view.stopped), vec!["b", "a"]);
        assert_eq!(view.stopped[0].task.total_length, "42");
        assert!(!view.stopped[0].archived);
        assert!(view.stopped[1].archived);
    }

    #[tokio::test]
    async fn failed_fetch_discards_cycle() {
        let h = harness();
        h.worker
            .set_lists(vec![], vec![], vec![task("g1", TaskStatus::Complete)]);
        h.worker.fail("tellWaiting", true);
        assert!(h.reconciler.poll_once().await.is_err());
        assert!(persisted_record(&h, "g1").await.is_none());
        assert!(h.reconciler.view().stopped.is_empty());

        h.worker.fail("tellWaiting", false);
        h.reconciler.poll_once().await.unwrap();
        assert!(persisted_record(&h, "g1").await.is_some());
    }

    #[tokio::test]
    async fn removing_archived_only_task_never_calls_worker() {
        let h = harness();
        h.worker
            .set_lists(vec![], vec![], vec![task("g1", TaskStatus::Complete)]);
        h.reconciler.poll_once().await.unwrap();
        h.worker.set_lists(vec![], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();
        assert!(h.reconciler.view().contains("g1"));

        let calls_before = h.worker.calls().len();
        let outcome = h.reconciler.remove("g1", false, false).await.unwrap();
        assert!(!outcome.worker_contacted);
        assert_eq!(h.worker.calls().len(), calls_before);

        assert!(persisted_record(&h, "g1").await.is_none());
        assert!(h.reconciler.records.lock().await.times.get("g1").is_none());
        assert!(!h.reconciler.view().contains("g1"));
    }

    #[tokio::test]
    async fn removing_active_task_uses_strong_removal_and_purges_history() {
        let h = harness();
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();

        let outcome = h.reconciler.remove("g1", false, false).await.unwrap();
        assert!(outcome.worker_contacted);
        assert_eq!(
            h.worker.mutating_calls(),
            vec!["forceRemove", "removeDownloadResult"]
        );
        assert!(!h.reconciler.view().contains("g1"));
    }

    #[tokio::test]
    async fn removing_completed_task_uses_soft_removal() {
        let h = harness();
        h.worker
            .set_lists(vec![], vec![], vec![task("g1", TaskStatus::Complete)]);
        h.reconciler.poll_once().await.unwrap();

        h.reconciler.remove("g1", false, false).await.unwrap();
        // The fake refuses `remove` on a stopped task; that is tolerated.
        assert_eq!(
            h.worker.mutating_calls(),
            vec!["remove", "removeDownloadResult"]
        );
        assert!(persisted_record(&h, "g1").await.is_none());
    }

    #[tokio::test]
    async fn remove_propagates_transport_errors() {
        let h = harness();
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.poll_once().await.unwrap();
        h.worker.fail("forceRemove", true);
        assert!(h.reconciler.remove("g1", false, false).await.is_err());
    }

    #[tokio::test]
    async fn remove_with_files_deletes_data_and_control_files() {
        let h = harness();
        let data = h.dir.path().join("a.iso");
        let control = h.dir.path().join("a.iso.aria2");
        std::fs::write(&data, b"x").unwrap();
        std::fs::write(&control, b"x").unwrap();

        let mut t = task("g1", TaskStatus::Complete);
        t.dir = h.dir.path().display().to_string();
        t.files = vec![TaskFile {
            path: "a.iso".into(),
            ..Default::default()
        }];
        h.worker.set_lists(vec![], vec![], vec![t]);
        h.reconciler.poll_once().await.unwrap();

        let outcome = h.reconciler.remove("g1", false, true).await.unwrap();
        assert_eq!(outcome.deleted_files.len(), 2);
        assert!(
            outcome
                .deleted_files
                .iter()
                .all(|d| d.outcome == DeletionOutcome::Deleted)
        );
        assert!(!data.exists());
        assert!(!control.exists());
    }

    #[tokio::test]
    async fn retry_resubmits_uris_and_drops_old_records() {
        let h = harness();
        let mut bad = task("bad", TaskStatus::Error);
        bad.dir = "/downloads".into();
        bad.files = vec![TaskFile {
            uris: vec![TaskUri {
                uri: "http://example.com/a.iso".into(),
                status: "used".into(),
            }],
            ..Default::default()
        }];
        h.worker.set_lists(vec![], vec![], vec![bad]);
        h.reconciler.poll_once().await.unwrap();

        let new_gid = h.reconciler.retry("bad").await.unwrap();
        assert_ne!(new_gid, "bad");
        assert_eq!(
            h.worker.mutating_calls(),
            vec!["forceRemove", "removeDownloadResult", "addUri"]
        );

        let status = h.worker.tell_status(&new_gid).await.unwrap();
        assert_eq!(status.source_uris(), vec!["http://example.com/a.iso"]);
        assert_eq!(status.dir, "/downloads");

        let records = h.reconciler.records.lock().await;
        assert!(records.times.get("bad").is_none());
        assert_eq!(records.times.get(&new_gid).unwrap().add_time_ms, Some(T0));
    }

    #[tokio::test]
    async fn retry_without_uris_fails() {
        let h = harness();
        h.worker
            .set_lists(vec![], vec![], vec![task("bad", TaskStatus::Error)]);
        let err = h.reconciler.retry("bad").await.unwrap_err();
        assert!(err.to_string().contains("no source URIs"));
        assert!(!h.worker.mutating_calls().contains(&"forceRemove".to_string()));
    }

    #[tokio::test]
    async fn add_uri_records_add_time_and_marks_session() {
        let h = harness();
        let gid = h
            .reconciler
            .add_uri(&["http://example.com/b.zip".into()], &BTreeMap::new())
            .await
            .unwrap();
        let records = h.reconciler.records.lock().await;
        let record = records.times.get(&gid).unwrap();
        assert_eq!(record.add_time_ms, Some(T0));
        assert_eq!(record.name.as_deref(), Some("b.zip"));
        drop(records);
        assert_eq!(h.reconciler.session.pending_count(), 1);
    }

    #[tokio::test]
    async fn pause_then_repolls() {
        let h = harness();
        h.worker
            .set_lists(vec![task("g1", TaskStatus::Active)], vec![], vec![]);
        h.reconciler.pause("g1", true).await.unwrap();
        assert_eq!(h.worker.count("forcePause"), 1);
        assert_eq!(h.worker.count("tellActive"), 1);
        assert_eq!(
            h.reconciler.view().active[0].task.status,
            TaskStatus::Paused
        );
    }

    #[tokio::test]
    async fn concurrent_poll_is_skipped() {
        let h = harness();
        let _held = h.reconciler.flight.lock().await;
        assert_eq!(
            h.reconciler.poll_once().await.unwrap(),
            CycleOutcome::Skipped
        );
        assert_eq!(h.worker.count("tellActive"), 0);
    }

    #[test]
    fn plan_is_pure_and_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut times = TaskTimeStore::load(&dir.path().join("t.json")).unwrap();
        times.apply_completes([("g1", None)], 10);
        let persisted = PersistedTaskStore::load(&dir.path().join("p.json")).unwrap();

        let prev = Snapshot {
            observed: true,
            ..Default::default()
        };
        let lists = TaskLists {
            stopped: vec![task("g1", TaskStatus::Complete)],
            ..Default::default()
        };
        let plan = plan_cycle(&prev, &lists, &times, &persisted, 99);
        assert!(plan.complete_times.is_empty());
        assert_eq!(plan.persist.len(), 1);
        assert_eq!(plan.persist[0].1, 10);
    }
}
