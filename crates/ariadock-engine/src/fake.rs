//! In-memory worker used by unit tests. Records every call.

use crate::error::RpcError;
use crate::rpc::WorkerApi;
use crate::task::{Task, TaskFile, TaskStatus, TaskUri};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    active: Vec<Task>,
    waiting: Vec<Task>,
    stopped: Vec<Task>,
    calls: Vec<(String, Option<String>)>,
    failing: HashSet<&'static str>,
    save_delay: Duration,
    next_gid: u32,
}

#[derive(Default)]
pub struct FakeWorker {
    state: Mutex<State>,
}

fn not_found(gid: &str) -> RpcError {
    RpcError::Remote {
        code: 1,
        message: format!("GID {gid} is not found"),
    }
}

impl FakeWorker {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_lists(&self, active: Vec<Task>, waiting: Vec<Task>, stopped: Vec<Task>) {
        let mut s = self.lock();
        s.active = active;
        s.waiting = waiting;
        s.stopped = stopped;
    }

    /// Make every call to `method` fail with a transport error.
    pub fn fail(&self, method: &'static str, failing: bool) {
        let mut s = self.lock();
        if failing {
            s.failing.insert(method);
        } else {
            s.failing.remove(method);
        }
    }

    pub fn fail_save_session(&self, failing: bool) {
        self.fail("saveSession", failing);
    }

    pub fn set_save_delay(&self, delay: Duration) {
        self.lock().save_delay = delay;
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.lock().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|(m, _)| m == method).count()
    }

    /// Calls other than the list and status reads.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|(m, _)| !m.starts_with("tell"))
            .map(|(m, _)| m.clone())
            .collect()
    }

    fn record(&self, method: &'static str, gid: Option<&str>) -> Result<(), RpcError> {
        let mut s = self.lock();
        s.calls.push((method.to_string(), gid.map(str::to_string)));
        if s.failing.contains(method) {
            return Err(RpcError::Transport(format!("{method} failed")));
        }
        Ok(())
    }

    fn find_mut<'a>(s: &'a mut State, gid: &str) -> Option<&'a mut Task> {
        s.active
            .iter_mut()
            .chain(s.waiting.iter_mut())
            .chain(s.stopped.iter_mut())
            .find(|t| t.gid == gid)
    }

    fn add(&self, uris: &[String], dir: Option<&String>) -> String {
        let mut s = self.lock();
        s.next_gid += 1;
        let gid = format!("fake{:012}", s.next_gid);
        let mut task = Task::new(&gid, TaskStatus::Waiting);
        task.dir = dir.cloned().unwrap_or_default();
        task.files = vec![TaskFile {
            index: "1".into(),
            uris: uris
                .iter()
                .map(|u| TaskUri {
                    uri: u.clone(),
                    status: "waiting".into(),
                })
                .collect(),
            ..Default::default()
        }];
        s.waiting.push(task);
        gid
    }

    fn take_live(&self, gid: &str) -> Result<(), RpcError> {
        let mut s = self.lock();
        let state = &mut *s;
        for list in [&mut state.active, &mut state.waiting] {
            if let Some(pos) = list.iter().position(|t| t.gid == gid) {
                let mut task = list.remove(pos);
                task.status = TaskStatus::Removed;
                state.stopped.push(task);
                return Ok(());
            }
        }
        Err(not_found(gid))
    }

    fn set_status(&self, gid: &str, status: TaskStatus) -> Result<(), RpcError> {
        let mut s = self.lock();
        match Self::find_mut(&mut s, gid) {
            Some(task) => {
                task.status = status;
                Ok(())
            }
            None => Err(not_found(gid)),
        }
    }
}

impl WorkerApi for FakeWorker {
    async fn tell_active(&self) -> Result<Vec<Task>, RpcError> {
        self.record("tellActive", None)?;
        Ok(self.lock().active.clone())
    }

    async fn tell_waiting(&self, _offset: usize, _num: usize) -> Result<Vec<Task>, RpcError> {
        self.record("tellWaiting", None)?;
        Ok(self.lock().waiting.clone())
    }

    async fn tell_stopped(&self, _offset: usize, _num: usize) -> Result<Vec<Task>, RpcError> {
        self.record("tellStopped", None)?;
        Ok(self.lock().stopped.clone())
    }

    async fn tell_status(&self, gid: &str) -> Result<Task, RpcError> {
        self.record("tellStatus", Some(gid))?;
        let mut s = self.lock();
        Self::find_mut(&mut s, gid)
            .map(|t| t.clone())
            .ok_or_else(|| not_found(gid))
    }

    async fn add_uri(
        &self,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<String, RpcError> {
        self.record("addUri", None)?;
        Ok(self.add(uris, options.get("dir")))
    }

    async fn add_torrent(
        &self,
        _torrent_b64: &str,
        uris: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<String, RpcError> {
        self.record("addTorrent", None)?;
        Ok(self.add(uris, options.get("dir")))
    }

    async fn remove(&self, gid: &str) -> Result<(), RpcError> {
        self.record("remove", Some(gid))?;
        self.take_live(gid)
    }

    async fn force_remove(&self, gid: &str) -> Result<(), RpcError> {
        self.record("forceRemove", Some(gid))?;
        self.take_live(gid)
    }

    async fn pause(&self, gid: &str) -> Result<(), RpcError> {
        self.record("pause", Some(gid))?;
        self.set_status(gid, TaskStatus::Paused)
    }

    async fn force_pause(&self, gid: &str) -> Result<(), RpcError> {
        self.record("forcePause", Some(gid))?;
        self.set_status(gid, TaskStatus::Paused)
    }

    async fn unpause(&self, gid: &str) -> Result<(), RpcError> {
        self.record("unpause", Some(gid))?;
        self.set_status(gid, TaskStatus::Waiting)
    }

    async fn remove_download_result(&self, gid: &str) -> Result<(), RpcError> {
        self.record("removeDownloadResult", Some(gid))?;
        let mut s = self.lock();
        let before = s.stopped.len();
        s.stopped.retain(|t| t.gid != gid);
        if s.stopped.len() == before {
            return Err(not_found(gid));
        }
        Ok(())
    }

    async fn save_session(&self) -> Result<(), RpcError> {
        let delay = self.lock().save_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.record("saveSession", None)
    }
}
