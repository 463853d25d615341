//! Worker process supervision.
//!
//! One [`Supervisor`] owns at most one worker process. `start`, `stop` and
//! `restart` are mutually exclusive: while one runs, the others are rejected
//! with [`SupervisorError::Busy`] instead of queueing. A watcher task owns the
//! child process and reports its exit, which drives crash handling.

use crate::config::{self, ConfigStore};
use crate::error::SupervisorError;
use crate::timer::SingleSlotTimer;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

const PROBE_INTERVAL: Duration = Duration::from_millis(50);
const PORT_RECHECK: Duration = Duration::from_millis(200);
const EVENT_CAPACITY: usize = 64;

/// Timeouts and delays. `Default` holds the production values.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub start_timeout: Duration,
    /// Running this long without exiting counts as started even if the RPC
    /// port never answers.
    pub start_grace: Duration,
    pub stop_timeout: Duration,
    pub crash_restart_delay: Duration,
    pub max_crash_retries: u32,
    pub cleanup_poll: Duration,
    pub cleanup_attempts: u32,
    pub port_settle: Duration,
    pub config_settle: Duration,
    pub config_verify_interval: Duration,
    pub config_verify_retries: u32,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            start_grace: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(8),
            crash_restart_delay: Duration::from_secs(3),
            max_crash_retries: 3,
            cleanup_poll: Duration::from_millis(500),
            cleanup_attempts: 20,
            port_settle: Duration::from_secs(2),
            config_settle: Duration::from_secs(1),
            config_verify_interval: Duration::from_millis(200),
            config_verify_retries: 5,
        }
    }
}

/// Everything needed to launch the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcessConfig {
    pub executable: PathBuf,
    pub config_file: PathBuf,
    pub session_file: PathBuf,
    pub port: u16,
    pub secret: Option<String>,
    pub download_dir: PathBuf,
    pub enable_rpc: bool,
    pub rpc_allow_origin_all: bool,
    pub auto_start: bool,
}

/// Partial update; `None` leaves a field unchanged. `Some("")` for the
/// secret clears it.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub enable_rpc: Option<bool>,
    pub rpc_allow_origin_all: Option<bool>,
    pub auto_start: Option<bool>,
}

impl WorkerProcessConfig {
    fn merged(&self, update: &ConfigUpdate) -> Self {
        let mut next = self.clone();
        if let Some(port) = update.port {
            next.port = port;
        }
        if let Some(secret) = &update.secret {
            next.secret = (!secret.is_empty()).then(|| secret.clone());
        }
        if let Some(dir) = &update.download_dir {
            next.download_dir = dir.clone();
        }
        if let Some(v) = update.enable_rpc {
            next.enable_rpc = v;
        }
        if let Some(v) = update.rpc_allow_origin_all {
            next.rpc_allow_origin_all = v;
        }
        if let Some(v) = update.auto_start {
            next.auto_start = v;
        }
        next
    }

    fn restart_fields_differ(&self, other: &Self) -> bool {
        self.port != other.port
            || self.secret != other.secret
            || self.download_dir != other.download_dir
    }
}

fn dir_value(dir: &std::path::Path) -> String {
    dir.to_string_lossy().replace('\\', "/")
}

/// Config-file writes implied by an update: `(key, Some(value))` to set,
/// `(key, None)` to disable.
fn store_writes(update: &ConfigUpdate) -> Vec<(&'static str, Option<String>)> {
    let mut writes = Vec::new();
    if let Some(port) = update.port {
        writes.push((config::KEY_PORT, Some(port.to_string())));
    }
    if let Some(secret) = &update.secret {
        writes.push((
            config::KEY_SECRET,
            (!secret.is_empty()).then(|| secret.clone()),
        ));
    }
    if let Some(dir) = &update.download_dir {
        writes.push((config::KEY_DIR, Some(dir_value(dir))));
    }
    if let Some(v) = update.enable_rpc {
        writes.push((config::KEY_ENABLE_RPC, Some(v.to_string())));
    }
    if let Some(v) = update.rpc_allow_origin_all {
        writes.push((config::KEY_ALLOW_ORIGIN_ALL, Some(v.to_string())));
    }
    writes
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;
                Self {
                    code: status.code(),
                    signal,
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "failed to wait on worker process");
                Self {
                    code: None,
                    signal: None,
                }
            }
        }
    }

    /// Abnormal termination: non-zero code, or a signal we did not send.
    pub fn is_crash(&self) -> bool {
        match (self.code, self.signal) {
            (Some(code), _) => code != 0,
            #[cfg(unix)]
            (None, Some(sig)) => !matches!(sig, libc::SIGTERM | libc::SIGKILL | libc::SIGINT),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started { pid: u32 },
    Exited(ExitInfo),
    RestartScheduled { attempt: u32, delay: Duration },
    RetriesExhausted { attempts: u32 },
    Stopped,
    ConfigRestartScheduled,
}

/// The transient lifecycle flag. Only one can be set at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Stopping,
    Restarting,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Stopping => "stopping",
            Phase::Restarting => "restarting",
        }
    }
}

struct RunningWorker {
    pid: u32,
    generation: u64,
    /// Still inside `start`; an exit now is a start failure, not a crash.
    starting: bool,
    stop_requested: bool,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl RunningWorker {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

struct WorkerHandle {
    running: Option<RunningWorker>,
    retry_count: u32,
    phase: Phase,
    generation: u64,
}

/// Effective worker settings as read back from the config file.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub port: u16,
    pub secret: Option<String>,
    pub download_dir: String,
    pub enable_rpc: bool,
    pub rpc_allow_origin_all: bool,
    pub auto_start: bool,
    pub config_file: PathBuf,
    pub executable: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub phase: Phase,
    pub retry_count: u32,
    pub executable_available: bool,
    pub config: EffectiveConfig,
}

struct PhaseGuard<'a> {
    supervisor: &'a Supervisor,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.handle().phase = Phase::Idle;
    }
}

pub struct Supervisor {
    config: Mutex<WorkerProcessConfig>,
    handle: Mutex<WorkerHandle>,
    timings: SupervisorTimings,
    events: broadcast::Sender<WorkerEvent>,
    crash_timer: SingleSlotTimer,
    config_timer: SingleSlotTimer,
}

impl Supervisor {
    pub fn new(config: WorkerProcessConfig, timings: SupervisorTimings) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config: Mutex::new(config),
            handle: Mutex::new(WorkerHandle {
                running: None,
                retry_count: 0,
                phase: Phase::Idle,
                generation: 0,
            }),
            timings,
            events,
            crash_timer: SingleSlotTimer::new(),
            config_timer: SingleSlotTimer::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> WorkerProcessConfig {
        self.lock_config().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle()
            .running
            .as_ref()
            .is_some_and(|r| !r.starting && !r.has_exited())
    }

    pub fn phase(&self) -> Phase {
        self.handle().phase
    }

    pub fn retry_count(&self) -> u32 {
        self.handle().retry_count
    }

    fn handle(&self) -> MutexGuard<'_, WorkerHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config(&self) -> MutexGuard<'_, WorkerProcessConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn enter(&self, phase: Phase) -> Result<PhaseGuard<'_>, SupervisorError> {
        let mut handle = self.handle();
        if handle.phase != Phase::Idle {
            return Err(SupervisorError::Busy(handle.phase.as_str()));
        }
        handle.phase = phase;
        Ok(PhaseGuard { supervisor: self })
    }

    // ------------------------------------------------------------------
    // start
    // ------------------------------------------------------------------

    /// Start the worker. Succeeds without doing anything if it is already
    /// running; a successful start resets the crash retry counter.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        {
            let handle = self.handle();
            if handle.phase != Phase::Starting
                && handle
                    .running
                    .as_ref()
                    .is_some_and(|r| !r.starting && !r.has_exited())
            {
                return Ok(());
            }
        }
        let _phase = self.enter(Phase::Starting)?;
        self.start_inner(true).await.map(drop)
    }

    async fn start_inner(self: &Arc<Self>, reset_retries: bool) -> Result<u32, SupervisorError> {
        if let Some(pid) = self.settle_previous_exit().await {
            return Ok(pid);
        }

        let cfg = self.config();
        if !cfg.executable.is_file() {
            return Err(SupervisorError::ExecutableNotFound(
                cfg.executable.display().to_string(),
            ));
        }
        let port = self.prepare_config_file(&cfg)?;
        self.wait_for_port(port).await?;

        let mut child = Command::new(&cfg.executable)
            .arg(format!("--conf-path={}", cfg.config_file.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::from_spawn(e, &cfg.executable))?;
        let pid = child.id().unwrap_or_default();
        forward_output(&mut child);

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, mut exit_rx) = watch::channel(None);
        let generation = {
            let mut handle = self.handle();
            handle.generation += 1;
            handle.running = Some(RunningWorker {
                pid,
                generation: handle.generation,
                starting: true,
                stop_requested: false,
                kill_tx: kill_tx.clone(),
                exit_rx: exit_rx.clone(),
            });
            handle.generation
        };
        self.spawn_watcher(child, generation, kill_rx, exit_tx);
        tracing::info!(pid, port, exe = %cfg.executable.display(), "worker spawned");

        match self.await_ready(port, &mut exit_rx).await {
            Ok(()) => {
                {
                    let mut handle = self.handle();
                    if let Some(running) = handle.running.as_mut()
                        && running.generation == generation
                    {
                        running.starting = false;
                    }
                    if reset_retries {
                        handle.retry_count = 0;
                    }
                }
                tracing::info!(pid, "worker started");
                self.emit(WorkerEvent::Started { pid });
                Ok(pid)
            }
            Err(e) => {
                let _ = kill_tx.try_send(());
                let _ = tokio::time::timeout(
                    self.timings.stop_timeout,
                    exit_rx.wait_for(|exit| exit.is_some()),
                )
                .await;
                self.clear_running(generation);
                tracing::warn!(pid, err = %e, "worker failed to start");
                Err(e)
            }
        }
    }

    /// If the recorded worker has exited but the watcher has not cleared it
    /// yet, wait for that. Returns the pid if a live worker is present.
    async fn settle_previous_exit(&self) -> Option<u32> {
        for _ in 0..100 {
            {
                let handle = self.handle();
                match &handle.running {
                    None => return None,
                    Some(r) if !r.has_exited() => return Some(r.pid),
                    Some(_) => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Make sure the config file exists and points the worker at our session
    /// file. Returns the RPC port the worker will bind.
    fn prepare_config_file(&self, cfg: &WorkerProcessConfig) -> Result<u16, SupervisorError> {
        if !cfg.session_file.exists() {
            if let Some(parent) = cfg.session_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cfg.session_file, b"")?;
        }
        let mut store = ConfigStore::open_or_create(&cfg.config_file, &cfg.download_dir)?;
        let session = cfg.session_file.display().to_string();
        if store.set_if_absent(config::KEY_INPUT_FILE, &session)? {
            tracing::info!("worker config: input-file initialized");
        }
        if store.set_if_absent(config::KEY_SAVE_SESSION, &session)? {
            tracing::info!("worker config: save-session initialized");
        }
        Ok(store
            .get(config::KEY_PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or(cfg.port))
    }

    /// Port pre-flight: wait for the RPC port to become bindable.
    async fn wait_for_port(&self, port: u16) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.timings.start_timeout;
        loop {
            if port_is_free(port) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::PortInUse(port));
            }
            tracing::debug!(port, "rpc port busy, waiting");
            tokio::time::sleep(PORT_RECHECK).await;
        }
    }

    async fn await_ready(
        &self,
        port: u16,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    ) -> Result<(), SupervisorError> {
        let started = Instant::now();
        let timeout = self.timings.start_timeout;
        let grace = self.timings.start_grace.min(timeout);
        loop {
            let exited = *exit_rx.borrow();
            if let Some(exit) = exited {
                return Err(SupervisorError::ExitedDuringStart {
                    code: exit.code,
                    signal: exit.signal,
                });
            }
            if probe(port).await {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= grace {
                tracing::debug!(port, "rpc port silent after grace period, assuming started");
                return Ok(());
            }
            if elapsed >= timeout {
                return Err(SupervisorError::StartTimeout(timeout.as_millis() as u64));
            }
            tokio::select! {
                _ = exit_rx.changed() => {}
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
        }
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        mut child: Child,
        generation: u64,
        mut kill_rx: mpsc::Receiver<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!(err = %e, "failed to kill worker");
                        }
                    }
                }
            };
            let exit = ExitInfo::from_status(status);
            let _ = exit_tx.send(Some(exit));
            this.on_exit(generation, exit);
        });
    }

    fn clear_running(&self, generation: u64) {
        let mut handle = self.handle();
        if handle
            .running
            .as_ref()
            .is_some_and(|r| r.generation == generation)
        {
            handle.running = None;
        }
    }

    // ------------------------------------------------------------------
    // crash handling
    // ------------------------------------------------------------------

    fn on_exit(self: &Arc<Self>, generation: u64, exit: ExitInfo) {
        let (unexpected, attempt) = {
            let mut handle = self.handle();
            let Some(running) = handle
                .running
                .take_if(|r| r.generation == generation)
            else {
                return;
            };
            if running.starting || running.stop_requested {
                (false, 0)
            } else {
                (true, handle.retry_count)
            }
        };
        tracing::info!(code = ?exit.code, signal = ?exit.signal, "worker exited");
        self.emit(WorkerEvent::Exited(exit));

        if !unexpected || !exit.is_crash() {
            return;
        }
        tracing::warn!(code = ?exit.code, signal = ?exit.signal, "worker crashed");
        if !self.lock_config().auto_start {
            return;
        }
        if attempt >= self.timings.max_crash_retries {
            self.give_up(attempt);
            return;
        }
        self.schedule_crash_restart();
    }

    fn schedule_crash_restart(self: &Arc<Self>) {
        let attempt = {
            let mut handle = self.handle();
            handle.retry_count += 1;
            handle.retry_count
        };
        let delay = self.timings.crash_restart_delay;
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "worker restart scheduled");
        self.emit(WorkerEvent::RestartScheduled { attempt, delay });
        let this = Arc::clone(self);
        self.crash_timer.arm(delay, async move {
            this.crash_restart().await;
        });
    }

    fn give_up(&self, attempts: u32) {
        tracing::error!(attempts, "worker keeps crashing, giving up");
        self.emit(WorkerEvent::RetriesExhausted { attempts });
    }

    async fn crash_restart(self: Arc<Self>) {
        let _phase = match self.enter(Phase::Starting) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::info!(err = %e, "skipping crash restart");
                return;
            }
        };
        match self.start_inner(false).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                let attempts = self.retry_count();
                if attempts < self.timings.max_crash_retries {
                    self.schedule_crash_restart();
                } else {
                    self.give_up(attempts);
                }
            }
            Err(e) => tracing::error!(err = %e, "crash restart failed"),
        }
    }

    // ------------------------------------------------------------------
    // stop / restart
    // ------------------------------------------------------------------

    /// Stop the worker: SIGTERM, then SIGKILL after the stop timeout.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.cancel_timers();
        let _phase = self.enter(Phase::Stopping)?;
        self.stop_inner().await
    }

    fn cancel_timers(&self) {
        if self.crash_timer.cancel() {
            tracing::debug!("pending crash restart cancelled");
        }
        if self.config_timer.cancel() {
            tracing::debug!("pending config restart cancelled");
        }
    }

    async fn stop_inner(&self) -> Result<(), SupervisorError> {
        self.cancel_timers();
        let target = {
            let mut handle = self.handle();
            handle.running.as_mut().map(|r| {
                r.stop_requested = true;
                (r.pid, r.generation, r.kill_tx.clone(), r.exit_rx.clone())
            })
        };
        let Some((pid, generation, kill_tx, mut exit_rx)) = target else {
            return Ok(());
        };

        tracing::info!(pid, "stopping worker");
        terminate(pid, &kill_tx);
        let graceful = tokio::time::timeout(
            self.timings.stop_timeout,
            exit_rx.wait_for(|exit| exit.is_some()),
        )
        .await
        .is_ok();

        let result = if graceful {
            Ok(())
        } else {
            tracing::warn!(pid, "worker ignored SIGTERM, killing");
            let _ = kill_tx.try_send(());
            let kill_wait = self.timings.cleanup_poll * self.timings.cleanup_attempts;
            match tokio::time::timeout(kill_wait, exit_rx.wait_for(|exit| exit.is_some())).await {
                Ok(_) => Ok(()),
                Err(_) => Err(SupervisorError::StopFailed(format!(
                    "pid {pid} did not exit after SIGKILL"
                ))),
            }
        };

        self.clear_running(generation);
        self.emit(WorkerEvent::Stopped);
        result
    }

    /// Stop, wait for the process to leave the process table and the port to
    /// be released, then start again. Any failure aborts the restart.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _phase = self.enter(Phase::Restarting)?;
        let pid = self.handle().running.as_ref().map(|r| r.pid);
        self.stop_inner().await?;

        if let Some(pid) = pid {
            let mut attempts = 0;
            while process_alive(pid) {
                attempts += 1;
                if attempts > self.timings.cleanup_attempts {
                    return Err(SupervisorError::StopFailed(format!(
                        "pid {pid} still present after stop"
                    )));
                }
                tokio::time::sleep(self.timings.cleanup_poll).await;
            }
            tokio::time::sleep(self.timings.port_settle).await;
        }

        self.start_inner(true).await.map(drop)
    }

    /// Stop for daemon shutdown: drop pending restarts and wait out any
    /// in-flight lifecycle operation first.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.cancel_timers();
        let deadline = Instant::now() + self.timings.start_timeout + self.timings.stop_timeout;
        loop {
            match self.enter(Phase::Stopping) {
                Ok(_phase) => return self.stop_inner().await,
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => tokio::time::sleep(PROBE_INTERVAL).await,
            }
        }
    }

    // ------------------------------------------------------------------
    // configuration
    // ------------------------------------------------------------------

    /// Merge `update` into the config and write the worker-facing keys. If a
    /// restart-required field changed while running, a restart is scheduled
    /// once the file is confirmed on disk. Returns whether one was scheduled.
    pub fn update_config(self: &Arc<Self>, update: ConfigUpdate) -> Result<bool, SupervisorError> {
        let (old, new) = {
            let mut cfg = self.lock_config();
            let old = cfg.clone();
            *cfg = old.merged(&update);
            (old, cfg.clone())
        };

        let writes = store_writes(&update);
        if !writes.is_empty() {
            let mut store = ConfigStore::open_or_create(&new.config_file, &new.download_dir)?;
            let sets: Vec<(&str, String)> = writes
                .iter()
                .filter_map(|(k, v)| v.clone().map(|v| (*k, v)))
                .collect();
            let disables: Vec<&str> = writes
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(k, _)| *k)
                .collect();
            store.apply(&sets, &disables)?;
        }

        if !old.restart_fields_differ(&new) || !self.is_running() {
            return Ok(false);
        }

        let expected: Vec<(&'static str, Option<String>)> = writes
            .into_iter()
            .filter(|(k, _)| config::requires_restart(k))
            .collect();
        let this = Arc::clone(self);
        self.config_timer.arm(self.timings.config_settle, async move {
            this.config_restart(expected).await;
        });
        tracing::info!("restart-required config changed, restart scheduled");
        self.emit(WorkerEvent::ConfigRestartScheduled);
        Ok(true)
    }

    async fn config_restart(self: Arc<Self>, expected: Vec<(&'static str, Option<String>)>) {
        if let Err(e) = self.verify_config(&expected).await {
            tracing::error!(err = %e, "config restart aborted");
            return;
        }
        match self.restart().await {
            Ok(()) => tracing::info!("worker restarted with new config"),
            Err(e) => tracing::error!(err = %e, "config restart failed"),
        }
    }

    /// Re-open the config file until it shows every expected value.
    async fn verify_config(
        &self,
        expected: &[(&'static str, Option<String>)],
    ) -> Result<(), SupervisorError> {
        let path = self.config().config_file;
        let mut last_mismatch = String::new();
        for attempt in 0..=self.timings.config_verify_retries {
            if attempt > 0 {
                tokio::time::sleep(self.timings.config_verify_interval).await;
            }
            let store = match ConfigStore::load(&path) {
                Ok(store) => store,
                Err(e) => {
                    last_mismatch = format!("{e:#}");
                    continue;
                }
            };
            match expected
                .iter()
                .find(|(k, v)| store.get(k) != v.as_deref())
            {
                None => return Ok(()),
                Some((k, _)) => last_mismatch = format!("{k} not yet written"),
            }
        }
        Err(SupervisorError::ConfigSync(last_mismatch))
    }

    /// Status with the effective config read back from the config file.
    pub fn status(&self) -> WorkerStatus {
        let cfg = self.config();
        let store = ConfigStore::load(&cfg.config_file).ok();
        let read = |key: &str| store.as_ref().and_then(|s| s.get(key).map(str::to_string));
        let flag = |key: &str, fallback: bool| read(key).map(|v| v == "true").unwrap_or(fallback);

        let (running, pid, phase, retry_count) = {
            let handle = self.handle();
            let live = handle
                .running
                .as_ref()
                .filter(|r| !r.starting && !r.has_exited());
            (
                live.is_some(),
                live.map(|r| r.pid),
                handle.phase,
                handle.retry_count,
            )
        };

        WorkerStatus {
            running,
            pid,
            phase,
            retry_count,
            executable_available: cfg.executable.is_file(),
            config: EffectiveConfig {
                port: read(config::KEY_PORT)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(cfg.port),
                secret: if store.is_some() {
                    read(config::KEY_SECRET)
                } else {
                    cfg.secret.clone()
                },
                download_dir: read(config::KEY_DIR).unwrap_or_else(|| dir_value(&cfg.download_dir)),
                enable_rpc: flag(config::KEY_ENABLE_RPC, cfg.enable_rpc),
                rpc_allow_origin_all: flag(config::KEY_ALLOW_ORIGIN_ALL, cfg.rpc_allow_origin_all),
                auto_start: cfg.auto_start,
                config_file: cfg.config_file.clone(),
                executable: cfg.executable.clone(),
            },
        }
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

async fn probe(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_INTERVAL, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
fn terminate(pid: u32, _kill_tx: &mpsc::Sender<()>) {
    // SAFETY: plain signal delivery to a pid we spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32, kill_tx: &mpsc::Sender<()>) {
    let _ = kill_tx.try_send(());
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

fn is_noise(line: &str) -> bool {
    const NOISE: [&str; 6] = [
        "Serialized session",
        "Saving the session",
        "[INFO]",
        "[DEBUG]",
        "RPC: ",
        "Download Results:",
    ];
    line.trim().is_empty() || NOISE.iter().any(|n| line.contains(n))
}

fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !is_noise(&line) {
                    tracing::debug!(target: "ariadock_engine::worker", "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "ariadock_engine::worker", "{line}");
            }
        });
    }
}
