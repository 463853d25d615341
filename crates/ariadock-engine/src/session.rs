//! Debounced "flush the worker's session file" requests.

use crate::rpc::WorkerApi;
use crate::timer::SingleSlotTimer;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);
const IN_FLIGHT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another save was already running.
    Skipped,
    Failed,
}

pub struct SessionSaveCoordinator<W> {
    worker: Arc<W>,
    pending: Mutex<HashSet<String>>,
    timer: SingleSlotTimer,
    saving: AtomicBool,
    debounce: Duration,
}

struct SavingGuard<'a>(&'a AtomicBool);

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<W: WorkerApi + 'static> SessionSaveCoordinator<W> {
    pub fn new(worker: Arc<W>) -> Arc<Self> {
        Self::with_debounce(worker, SAVE_DEBOUNCE)
    }

    pub fn with_debounce(worker: Arc<W>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            worker,
            pending: Mutex::new(HashSet::new()),
            timer: SingleSlotTimer::new(),
            saving: AtomicBool::new(false),
            debounce,
        })
    }

    /// Note that `gid` changed and re-arm the debounce window.
    pub fn mark_for_save(self: &Arc<Self>, gid: &str) {
        self.lock_pending().insert(gid.to_string());
        let this = Arc::clone(self);
        self.timer.arm(self.debounce, async move {
            this.save_immediate().await;
        });
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Flush now. A save already in flight makes this a no-op.
    pub async fn save_immediate(&self) -> SaveOutcome {
        if self.saving.swap(true, Ordering::AcqRel) {
            tracing::debug!("session save already in flight, skipping");
            return SaveOutcome::Skipped;
        }
        let _guard = SavingGuard(&self.saving);

        let flushed: Vec<String> = self.lock_pending().iter().cloned().collect();
        match self.worker.save_session().await {
            Ok(()) => {
                let mut pending = self.lock_pending();
                for gid in &flushed {
                    pending.remove(gid);
                }
                tracing::debug!(tasks = flushed.len(), "worker session saved");
                SaveOutcome::Saved
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to save worker session");
                SaveOutcome::Failed
            }
        }
    }

    /// Cancel any pending debounce and perform one last save, waiting for an
    /// in-flight save to finish first. Callers bound this with a timeout.
    pub async fn force_exit(&self) -> SaveOutcome {
        self.timer.cancel();
        while self.saving.load(Ordering::Acquire) {
            tokio::time::sleep(IN_FLIGHT_POLL).await;
        }
        self.save_immediate().await
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeWorker;

    #[tokio::test(start_paused = true)]
    async fn marks_within_window_collapse_into_one_save() {
        let worker = Arc::new(FakeWorker::default());
        let coordinator = SessionSaveCoordinator::new(worker.clone());

        coordinator.mark_for_save("g1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        coordinator.mark_for_save("g2");
        tokio::time::sleep(Duration::from_millis(200)).await;
        coordinator.mark_for_save("g3");
        assert_eq!(coordinator.pending_count(), 3);
        assert_eq!(worker.count("saveSession"), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(worker.count("saveSession"), 1);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_keeps_pending_set() {
        let worker = Arc::new(FakeWorker::default());
        worker.fail_save_session(true);
        let coordinator = SessionSaveCoordinator::new(worker.clone());

        coordinator.mark_for_save("g1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(worker.count("saveSession"), 1);
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_immediate_save_is_skipped() {
        let worker = Arc::new(FakeWorker::default());
        worker.set_save_delay(Duration::from_millis(300));
        let coordinator = SessionSaveCoordinator::new(worker.clone());

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.save_immediate().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.save_immediate().await, SaveOutcome::Skipped);
        assert_eq!(first.await.unwrap(), SaveOutcome::Saved);
        assert_eq!(worker.count("saveSession"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_exit_cancels_debounce_and_saves_once() {
        let worker = Arc::new(FakeWorker::default());
        let coordinator = SessionSaveCoordinator::new(worker.clone());

        coordinator.mark_for_save("g1");
        assert_eq!(coordinator.force_exit().await, SaveOutcome::Saved);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(worker.count("saveSession"), 1);
    }
}
