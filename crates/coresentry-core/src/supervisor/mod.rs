//! Core process supervisor.
//!
//! Owns the lifecycle of the core subprocess: spawn, startup detection,
//! crash detection, bounded auto-restart, termination and health reporting.
//!
//! ## State machine
//!
//! ```text
//!         start()                 success marker
//!  Idle ───────────▶ Starting ─────────────────▶ Running
//!   ▲  ▲                │ fatal / timeout          │  │
//!   │  └────────────────┘                  stop()  │  │ crash (exit-wait or scan)
//!   │                                              ▼  ▼
//!   └──────────────── Stopping ◀──────────── CrashedRetrying ──▶ Failed
//!                                            (restart budget)   (budget spent)
//! ```
//!
//! Start, stop and restart are serialized by a single async mutex. The
//! state itself lives in an atomic so status and health reads never wait
//! behind an in-flight start. `start()` claims the `Starting` state with a
//! compare-and-swap before taking the lock, so a concurrent second start
//! fails fast with [`SupervisorError::AlreadyRunning`].
//!
//! Every spawn gets a fresh generation number. The exit watcher and the
//! process-table poller of a generation publish [`CrashEvent`]s into one
//! channel; a single recovery task consumes them and drops events whose
//! generation is no longer current, so two detectors firing for the same
//! crash cause one restart.
//!
//! A child that exits with status 0 is not a crash by itself: the core may
//! have handed off to a successor of the same name. The poller settles it
//! on its next tick, adopting the successor or reporting the core vanished.

pub mod format;
pub mod output;
pub mod process_table;
pub mod terminate;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use coresentry_config::{CoreConfig, TerminationPolicy};

use self::format::{format_memory, format_uptime};
use self::output::{OutputBuffer, OutputDecoder, StartupOutcome, detect_startup, spawn_capture};
use self::process_table::{OsProcessTable, ProcessEntry, ProcessTable};
use self::terminate::{CONFIRM_ATTEMPTS, CONFIRM_INTERVAL, terminate_by_name, terminate_pid};

/// Environment flag passed to every core so it does not reject traffic
/// looping back through the system proxy it installs.
pub const LOOPBACK_DETECTOR_ENV: (&str, &str) = ("DISABLE_LOOPBACK_DETECTOR", "true");

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("core process is already running")]
    AlreadyRunning,

    #[error("core process is not running")]
    NotRunning,

    #[error("core process did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("core process failed to start: {0}")]
    StartupFatal(String),

    #[error("failed to terminate core process: {0}")]
    TerminationFailed(String),

    #[error("no core binary configured")]
    NotConfigured,

    #[error("failed to spawn core process {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to query process {pid}: {reason}")]
    ProcessQuery { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of the supervised core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SupervisorState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    CrashedRetrying = 4,
    Failed = 5,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::CrashedRetrying,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::CrashedRetrying => "crashed_retrying",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of the running core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Resident memory in bytes.
    pub memory: u64,
    pub memory_format: String,
    pub start_time: DateTime<Utc>,
    pub uptime: String,
}

/// Which detector noticed a crash.
#[derive(Debug, Clone)]
pub enum CrashSource {
    /// The spawned child failed without being asked to stop.
    Exited(String),
    /// The executable vanished from the process table.
    Vanished,
}

/// A crash report for one spawn generation.
#[derive(Debug, Clone)]
pub struct CrashEvent {
    pub generation: u64,
    pub source: CrashSource,
}

/// The live subprocess of one generation. Replaced, never reused, on restart.
struct CoreProcessHandle {
    generation: u64,
    child_pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    /// Dropping or signalling this stops the generation's poller.
    cancel: watch::Sender<bool>,
}

impl CoreProcessHandle {
    fn cancel_monitors(&self) {
        let _ = self.cancel.send(true);
    }

    fn request_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    fn retire(mut self) {
        self.cancel_monitors();
        self.request_kill();
    }
}

struct Inner {
    config: CoreConfig,
    table: Arc<dyn ProcessTable>,
    decoder: OutputDecoder,
    lifecycle: tokio::sync::Mutex<Option<CoreProcessHandle>>,
    state: AtomicU8,
    auto_restart: AtomicBool,
    generation: AtomicU64,
    pid: AtomicU32,
    restarts_used: AtomicU32,
    started_at: Mutex<SystemTime>,
    running_since: Mutex<Instant>,
    events: mpsc::UnboundedSender<CrashEvent>,
}

/// Supervisor for the core subprocess. Cheap to clone; all clones share
/// one lifecycle.
///
/// Must be created inside a Tokio runtime: construction spawns the crash
/// recovery task.
#[derive(Clone)]
pub struct CoreSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CoreSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreSupervisor")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl CoreSupervisor {
    /// Create a supervisor that queries the real OS process table.
    pub fn new(config: CoreConfig) -> Self {
        Self::with_process_table(config, Arc::new(OsProcessTable::new()))
    }

    /// Create a supervisor with a custom process table.
    pub fn with_process_table(config: CoreConfig, table: Arc<dyn ProcessTable>) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            decoder: OutputDecoder::new(config.output_encoding.as_deref()),
            config,
            table,
            lifecycle: tokio::sync::Mutex::new(None),
            state: AtomicU8::new(SupervisorState::Idle as u8),
            auto_restart: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            pid: AtomicU32::new(0),
            restarts_used: AtomicU32::new(0),
            started_at: Mutex::new(SystemTime::now()),
            running_since: Mutex::new(Instant::now()),
            events,
        });
        tokio::spawn(recovery_loop(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    /// Tracked PID while a core is running.
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Spawn the core and wait until it reports ready.
    ///
    /// Blocks for up to the configured startup timeout. A successful start
    /// re-enables auto-restart and resets the restart budget.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.inner.claim_start()?;
        let mut slot = self.inner.lifecycle.lock().await;

        // Another transition may have run between the claim and the lock.
        if self.inner.state() != SupervisorState::Starting {
            self.inner.claim_start()?;
        }

        match self.inner.start_claimed(&mut slot).await {
            Ok(()) => {
                self.inner.restarts_used.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(SupervisorState::Idle);
                error!(error = %e, "Core process start failed");
                Err(e)
            }
        }
    }

    /// Terminate the core. Succeeds without side effects when nothing runs.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.inner.auto_restart.store(false, Ordering::SeqCst);
        let mut slot = self.inner.lifecycle.lock().await;

        if slot.is_none() {
            // Cancels a pending recovery and clears a spent budget.
            if matches!(
                self.inner.state(),
                SupervisorState::CrashedRetrying | SupervisorState::Failed
            ) {
                self.inner.set_state(SupervisorState::Idle);
            }
            debug!("Stop requested but no core process is running");
            return Ok(());
        }

        let previous = self.inner.state();
        self.inner.set_state(SupervisorState::Stopping);
        match self.inner.stop_locked(&mut slot).await {
            Ok(()) => {
                self.inner.set_state(SupervisorState::Idle);
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(previous);
                error!(error = %e, "Core process stop failed");
                Err(e)
            }
        }
    }

    /// Stop, wait the settle delay, then start.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.inner.auto_restart.store(false, Ordering::SeqCst);
        let mut slot = self.inner.lifecycle.lock().await;

        let previous = self.inner.state();
        if matches!(previous, SupervisorState::Starting) {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.inner.set_state(SupervisorState::Stopping);
        if let Err(e) = self.inner.stop_locked(&mut slot).await {
            self.inner.set_state(previous);
            error!(error = %e, "Core process restart failed while stopping");
            return Err(e);
        }

        tokio::time::sleep(self.inner.settle_delay()).await;

        self.inner.set_state(SupervisorState::Starting);
        match self.inner.start_claimed(&mut slot).await {
            Ok(()) => {
                self.inner.restarts_used.store(0, Ordering::SeqCst);
                info!("Core process restarted");
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(SupervisorState::Idle);
                error!(error = %e, "Core process restart failed while starting");
                Err(e)
            }
        }
    }

    /// Snapshot of the running core with freshly queried memory usage.
    pub async fn process_info(&self) -> Result<ProcessInfo, SupervisorError> {
        if self.state() != SupervisorState::Running {
            return Err(SupervisorError::NotRunning);
        }
        let pid = self.pid().ok_or(SupervisorError::NotRunning)?;

        let stat = self
            .inner
            .table
            .stat(pid)
            .await
            .map_err(|e| SupervisorError::ProcessQuery {
                pid,
                reason: e.to_string(),
            })?
            .ok_or_else(|| SupervisorError::ProcessQuery {
                pid,
                reason: "process not found".to_string(),
            })?;

        let started_at = *self.inner.started_at.lock().unwrap_or_else(|e| e.into_inner());
        let uptime = SystemTime::now()
            .duration_since(started_at)
            .unwrap_or_default();

        Ok(ProcessInfo {
            pid,
            memory: stat.rss,
            memory_format: format_memory(stat.rss),
            start_time: DateTime::<Utc>::from(started_at),
            uptime: format_uptime(uptime),
        })
    }

    /// Whether the core is running and queryable. High memory use is
    /// logged but does not make the core unhealthy.
    pub async fn is_healthy(&self) -> bool {
        match self.process_info().await {
            Ok(info) => {
                if info.memory > self.inner.config.memory_warn_bytes {
                    warn!(
                        pid = info.pid,
                        memory = %info.memory_format,
                        "Core process memory usage is high"
                    );
                }
                true
            }
            Err(e) => {
                debug!(error = %e, "Core process health check failed");
                false
            }
        }
    }
}

impl Inner {
    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SupervisorState) {
        let old = SupervisorState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if old != state {
            debug!(from = %old, to = %state, "Supervisor state changed");
        }
    }

    fn transition(&self, from: SupervisorState, to: SupervisorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn claim_start(&self) -> Result<(), SupervisorError> {
        for from in [
            SupervisorState::Idle,
            SupervisorState::Failed,
            SupervisorState::CrashedRetrying,
        ] {
            if self.transition(from, SupervisorState::Starting) {
                return Ok(());
            }
        }
        Err(SupervisorError::AlreadyRunning)
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.config.restart_settle_ms)
    }

    /// Linear backoff before the next restart attempt, saturating at the
    /// largest representable delay.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.config
                .restart_backoff_ms
                .saturating_mul(u64::from(attempt)),
        )
    }

    fn publish(&self, event: CrashEvent) {
        let _ = self.events.send(event);
    }

    /// Spawn a new generation and wait for the startup verdict. The caller
    /// holds the lifecycle lock and has put the state in `Starting`; on
    /// error the caller decides the next state.
    async fn start_claimed(
        self: &Arc<Self>,
        slot: &mut Option<CoreProcessHandle>,
    ) -> Result<(), SupervisorError> {
        let binary = self
            .config
            .binary
            .clone()
            .ok_or(SupervisorError::NotConfigured)?;
        let name = self
            .config
            .process_name()
            .ok_or(SupervisorError::NotConfigured)?;

        if let Some(old) = slot.take() {
            debug!(generation = old.generation, "Retiring previous core handle");
            old.retire();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut command = tokio::process::Command::new(&binary);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .env(LOOPBACK_DETECTOR_ENV.0, LOOPBACK_DETECTOR_ENV.1)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            path: binary.clone(),
            source,
        })?;
        let child_pid = child.id().unwrap_or(0);

        let stdout = OutputBuffer::new(self.config.output_buffer_bytes);
        let stderr = OutputBuffer::new(self.config.output_buffer_bytes);
        if let Some(out) = child.stdout.take() {
            spawn_capture(out, stdout.clone(), true);
        }
        if let Some(err) = child.stderr.take() {
            spawn_capture(err, stderr.clone(), false);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(watch_exit(
            Arc::downgrade(self),
            generation,
            child,
            kill_rx,
            exited_tx,
            stderr,
        ));

        self.pid.store(child_pid, Ordering::SeqCst);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = SystemTime::now();
        info!(pid = child_pid, generation, path = %binary.display(), "Core process spawned");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = CoreProcessHandle {
            generation,
            child_pid,
            kill_tx: Some(kill_tx),
            exited: exited_rx.clone(),
            cancel: cancel_tx,
        };

        match self.wait_for_startup(&stdout, exited_rx).await {
            Ok(()) => {
                *self.running_since.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                self.auto_restart.store(true, Ordering::SeqCst);
                self.set_state(SupervisorState::Running);
                tokio::spawn(poll_process_table(
                    Arc::downgrade(self),
                    generation,
                    name,
                    Duration::from_millis(self.config.monitor_interval_ms),
                    cancel_rx,
                ));
                *slot = Some(handle);
                info!(pid = child_pid, generation, "Core process started");
                Ok(())
            }
            Err(e) => {
                handle.retire();
                self.pid.store(0, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn wait_for_startup(
        &self,
        stdout: &OutputBuffer,
        exited: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        let timeout = Duration::from_millis(self.config.startup_timeout_ms);
        let period = Duration::from_millis(self.config.startup_poll_ms);

        let poll = async {
            let mut ticker = tokio::time::interval(period);
            let mut exit_seen = false;
            loop {
                ticker.tick().await;
                let raw = stdout.snapshot();
                let text = self.decoder.decode(&raw);
                match detect_startup(
                    &text,
                    &self.config.success_marker,
                    &self.config.fatal_marker,
                ) {
                    Some(StartupOutcome::Ready) => return Ok(()),
                    Some(StartupOutcome::Fatal(message)) => {
                        return Err(SupervisorError::StartupFatal(message));
                    }
                    None => {}
                }
                // One extra tick after exit lets the capture drain.
                if exit_seen {
                    return Err(SupervisorError::StartupFatal(
                        "core process exited before becoming ready".to_string(),
                    ));
                }
                exit_seen = *exited.borrow();
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::StartupTimeout(timeout)),
        }
    }

    /// Terminate the current generation. The caller holds the lifecycle lock
    /// and sets the resulting state. On failure the handle is put back.
    async fn stop_locked(&self, slot: &mut Option<CoreProcessHandle>) -> Result<(), SupervisorError> {
        let Some(mut handle) = slot.take() else {
            return Ok(());
        };
        self.auto_restart.store(false, Ordering::SeqCst);
        handle.cancel_monitors();

        let result = match self.config.termination {
            TerminationPolicy::ByName => match self.config.process_name() {
                Some(name) => terminate_by_name(self.table.as_ref(), &name).await,
                None => Err(SupervisorError::NotConfigured),
            },
            TerminationPolicy::TrackedPid => self.terminate_tracked(&mut handle).await,
        };

        match result {
            Ok(()) => {
                handle.request_kill();
                self.pid.store(0, Ordering::SeqCst);
                info!(generation = handle.generation, "Core process stopped");
                Ok(())
            }
            Err(e) => {
                *slot = Some(handle);
                Err(e)
            }
        }
    }

    async fn terminate_tracked(&self, handle: &mut CoreProcessHandle) -> Result<(), SupervisorError> {
        let tracked = self.pid.load(Ordering::SeqCst);
        if tracked != 0 && tracked != handle.child_pid {
            // Adopted instance, not our child.
            terminate_pid(self.table.as_ref(), tracked).await?;
        }

        handle.request_kill();
        let grace = CONFIRM_INTERVAL * CONFIRM_ATTEMPTS;
        match tokio::time::timeout(grace, handle.exited.wait_for(|exited| *exited)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(SupervisorError::TerminationFailed(format!(
                "pid {} did not exit within {grace:?}",
                handle.child_pid
            ))),
        }
    }

    fn adopt(&self, entry: ProcessEntry) {
        let old = self.pid.swap(entry.pid, Ordering::SeqCst);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) =
            entry.start_time.unwrap_or_else(SystemTime::now);
        info!(old_pid = old, new_pid = entry.pid, "Core process PID changed, adopting new PID");
    }

    async fn recover(self: &Arc<Self>, event: CrashEvent) {
        let current = self.generation.load(Ordering::SeqCst);
        if event.generation != current {
            debug!(generation = event.generation, current, "Ignoring crash event from stale generation");
            return;
        }
        if !self.transition(SupervisorState::Running, SupervisorState::CrashedRetrying) {
            debug!(generation = event.generation, state = %self.state(), "Ignoring crash event outside Running");
            return;
        }

        let ran_for = self
            .running_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        let pid = self.pid.swap(0, Ordering::SeqCst);
        warn!(pid, generation = event.generation, source = ?event.source, "Core process crashed");

        if !self.auto_restart.load(Ordering::SeqCst) {
            self.transition(SupervisorState::CrashedRetrying, SupervisorState::Idle);
            return;
        }
        if ran_for >= Duration::from_secs(self.config.stable_after_secs) {
            self.restarts_used.store(0, Ordering::SeqCst);
        }

        let max = self.config.max_restart_attempts;
        loop {
            let used = self.restarts_used.load(Ordering::SeqCst);
            if used >= max {
                break;
            }
            let attempt = used + 1;
            self.restarts_used.store(attempt, Ordering::SeqCst);

            let result = {
                let mut slot = self.lifecycle.lock().await;
                if self.state() != SupervisorState::CrashedRetrying
                    || !self.auto_restart.load(Ordering::SeqCst)
                {
                    info!(attempt, "Automatic restart superseded by a client request");
                    return;
                }
                self.set_state(SupervisorState::Stopping);
                // A stuck remnant only delays the new spawn.
                if let Err(e) = self.stop_locked(&mut slot).await {
                    warn!(attempt, error = %e, "Failed to clean up crashed core");
                    if let Some(stuck) = slot.take() {
                        stuck.retire();
                    }
                }
                tokio::time::sleep(self.settle_delay()).await;
                self.set_state(SupervisorState::Starting);
                let result = self.start_claimed(&mut slot).await;
                if result.is_err() {
                    self.set_state(SupervisorState::CrashedRetrying);
                    self.auto_restart.store(true, Ordering::SeqCst);
                }
                result
            };

            match result {
                Ok(()) => {
                    info!(attempt, max, "Core process restarted after crash");
                    return;
                }
                Err(e) => {
                    warn!(attempt, max, error = %e, "Core process restart attempt failed");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
            }
        }

        if self.transition(SupervisorState::CrashedRetrying, SupervisorState::Failed) {
            self.auto_restart.store(false, Ordering::SeqCst);
            error!(
                attempts = max,
                "Core process restart budget exhausted, waiting for an explicit start"
            );
        }
    }
}

async fn recovery_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<CrashEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.recover(event).await;
    }
    debug!("Crash recovery loop finished");
}

/// Exit-wait detector: owns the child, reaps it, and reports a failed exit
/// that was not requested through `kill_rx`.
async fn watch_exit(
    inner: Weak<Inner>,
    generation: u64,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    stderr: OutputBuffer,
) {
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut kill_rx => None,
    };

    let status = match status {
        Some(status) => status,
        None => {
            if let Err(e) = child.kill().await {
                debug!(generation, error = %e, "Core child already gone");
            }
            let _ = exited_tx.send(true);
            return;
        }
    };
    let _ = exited_tx.send(true);

    let Some(inner) = inner.upgrade() else { return };
    let status = match status {
        Ok(s) if s.success() => {
            info!(generation, "Core child exited cleanly, leaving the verdict to the process table poller");
            return;
        }
        Ok(s) => s.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    if inner.generation.load(Ordering::SeqCst) == generation
        && inner.state() == SupervisorState::Running
    {
        let tail = stderr_tail(&inner.decoder, &stderr);
        warn!(generation, status = %status, stderr = %tail, "Core process exited unexpectedly");
    }
    inner.publish(CrashEvent {
        generation,
        source: CrashSource::Exited(status),
    });
}

/// Polling detector: scans the process table by executable name, reports a
/// vanished core and adopts a core that reappeared under another PID.
async fn poll_process_table(
    inner: Weak<Inner>,
    generation: u64,
    name: String,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.changed() => break,
        }
        if *cancel.borrow() {
            break;
        }
        let Some(inner) = inner.upgrade() else { break };
        if inner.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        if inner.state() != SupervisorState::Running {
            continue;
        }

        let entries = match inner.table.find_by_name(&name).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(name = %name, error = %e, "Process table query failed");
                continue;
            }
        };

        let tracked = inner.pid.load(Ordering::SeqCst);
        match entries.first() {
            None => {
                warn!(pid = tracked, generation, "Core process vanished from the process table");
                inner.publish(CrashEvent {
                    generation,
                    source: CrashSource::Vanished,
                });
                break;
            }
            Some(_) if entries.iter().any(|e| e.pid == tracked) => {}
            Some(first) => inner.adopt(*first),
        }
    }
    debug!(generation, "Process table poller finished");
}

fn stderr_tail(decoder: &OutputDecoder, stderr: &OutputBuffer) -> String {
    const TAIL: usize = 2048;
    let raw = stderr.snapshot();
    let start = raw.len().saturating_sub(TAIL);
    decoder.decode(&raw[start..]).trim().to_string()
}
