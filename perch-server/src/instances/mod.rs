//! Service lifecycle management
//!
//! A [`ProcessRunner`] owns at most one OS process for one service: it
//! launches it, waits for readiness, records crashes and tears it down.
//! [`ServiceGroup`] sequences several runners that make up one app.

mod group;
mod health;
mod ports;
mod spawner;

pub use group::*;
pub use health::*;
pub use ports::*;
pub use spawner::*;

use crate::defaults::OUTPUT_DRAIN_TIMEOUT;
use crate::error::SupervisorError;
use crate::logs::LogBuffer;
use parking_lot::{Mutex, RwLock};
use perch_core::{Status, StatusDetail};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// What to run for one service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Shell command line
    pub command: String,
    /// Working directory
    pub dir: PathBuf,
    /// Extra environment; `$PORT` is expanded
    pub env: BTreeMap<String, String>,
    /// Fixed port (otherwise one is allocated per start)
    pub port: Option<u16>,
    /// Output text that marks the service ready instead of a port probe
    pub ready_pattern: Option<String>,
}

/// Lifecycle state of a runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Starting { port: u16, since: Instant },
    Running { port: u16, since: Instant },
    Failed { error: String },
}

impl RunnerState {
    pub fn status(&self) -> Status {
        match self {
            RunnerState::Idle => Status::Idle,
            RunnerState::Starting { .. } => Status::Starting,
            RunnerState::Running { .. } => Status::Running,
            RunnerState::Failed { .. } => Status::Failed,
        }
    }

    /// Starting or running, i.e. a process exists or is about to
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunnerState::Starting { .. } | RunnerState::Running { .. }
        )
    }

    pub fn detail(&self) -> StatusDetail {
        match self {
            RunnerState::Idle => StatusDetail::Idle,
            RunnerState::Starting { port, .. } => StatusDetail::Starting { port: *port },
            RunnerState::Running { port, since } => StatusDetail::Running {
                port: *port,
                uptime: since.elapsed(),
            },
            RunnerState::Failed { error } => StatusDetail::Failed {
                error: error.clone(),
            },
        }
    }
}

/// Emitted on every status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEvent {
    pub service: String,
    pub status: Status,
}

struct ActiveRun {
    pid: Option<u32>,
    port: u16,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Supervises one service process
pub struct ProcessRunner {
    /// Service key (`<service>-<app>` or the app name)
    key: String,
    spec: ServiceSpec,
    state: RwLock<RunnerState>,
    logs: Arc<LogBuffer>,
    active: Mutex<Option<ActiveRun>>,
    /// Serializes start/stop/restart on this runner
    ops: tokio::sync::Mutex<()>,
    options: LaunchOptions,
    ports: Arc<PortAllocator>,
    events: mpsc::Sender<RunnerEvent>,
}

impl ProcessRunner {
    pub fn new(
        key: impl Into<String>,
        spec: ServiceSpec,
        logs: Arc<LogBuffer>,
        options: LaunchOptions,
        ports: Arc<PortAllocator>,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Self {
        Self {
            key: key.into(),
            spec,
            state: RwLock::new(RunnerState::Idle),
            logs,
            active: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
            options,
            ports,
            events,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn spec(&self) -> ServiceSpec {
        self.spec.clone()
    }

    pub fn state(&self) -> RunnerState {
        self.state.read().clone()
    }

    pub fn status(&self) -> Status {
        self.state.read().status()
    }

    pub fn detail(&self) -> StatusDetail {
        self.state.read().detail()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().is_active()
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn pid(&self) -> Option<u32> {
        self.active.lock().as_ref().and_then(|run| run.pid)
    }

    /// Start the process unless it is already starting or running.
    ///
    /// Returns once the process has been launched (state `Starting`);
    /// readiness is tracked in the background.
    pub async fn start(self: &Arc<Self>) -> Result<RunnerState, SupervisorError> {
        let _guard = self.ops.lock().await;
        let current = self.state();
        if current.is_active() {
            tracing::debug!(service = %self.key, status = %current.status(), "Already active");
            return Ok(current);
        }
        self.halt().await;
        self.launch()
    }

    /// Stop the process (if any) and go idle. Also clears a failure.
    pub async fn stop(&self) {
        let _guard = self.ops.lock().await;
        self.halt().await;
        self.set_state(RunnerState::Idle);
    }

    /// Stop then start again, without passing through `Idle`.
    pub async fn restart(self: &Arc<Self>) -> Result<RunnerState, SupervisorError> {
        let _guard = self.ops.lock().await;
        self.halt().await;
        self.launch()
    }

    /// Return a failed runner to idle. No effect in any other state.
    pub fn clear_failure(&self) -> bool {
        let cleared = {
            let mut state = self.state.write();
            if matches!(*state, RunnerState::Failed { .. }) {
                *state = RunnerState::Idle;
                true
            } else {
                false
            }
        };
        if cleared {
            self.emit(Status::Idle);
        }
        cleared
    }

    /// Tear down the current run (if any) and wait for its supervision task.
    /// Leaves the state untouched.
    async fn halt(&self) {
        let Some(run) = self.active.lock().take() else {
            return;
        };
        tracing::info!(service = %self.key, pid = ?run.pid, port = run.port, "Stopping service");
        // The task may already be done (crash, readiness timeout).
        let _ = run.stop_tx.send(());
        if let Err(e) = run.task.await {
            tracing::warn!(service = %self.key, error = %e, "Supervision task ended abnormally");
        }
    }

    fn launch(self: &Arc<Self>) -> Result<RunnerState, SupervisorError> {
        let spec = self.spec();
        let port = match spec.port {
            Some(port) => port,
            None => match self.ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            },
        };

        self.logs.clear();
        tracing::info!(
            service = %self.key,
            port,
            command = %spec.command,
            dir = %spec.dir.display(),
            "Starting service"
        );

        let mut child = match spawn(&spec, port, &self.options.shell) {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    command: spec.command.clone(),
                    source,
                };
                self.logs.push(format!("[perch] {err}"));
                self.fail(&err);
                return Err(err);
            }
        };

        let matched = Arc::new(Notify::new());
        let (check, signal) = match spec.ready_pattern {
            Some(pattern) => (
                ReadinessCheck::Pattern {
                    pattern: pattern.clone(),
                    matched: matched.clone(),
                },
                Some(ReadySignal::new(pattern, matched)),
            ),
            None => (ReadinessCheck::Port(port), None),
        };
        let pumps = capture_output(&mut child, &self.key, self.logs.clone(), signal);
        let probe = ReadinessProbe::new(check, self.options.probe_interval);

        let since = Instant::now();
        self.set_state(RunnerState::Starting { port, since });

        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().supervise(child, pumps, port, probe, stop_rx));
        *self.active.lock() = Some(ActiveRun {
            pid,
            port,
            stop_tx,
            task,
        });

        Ok(self.state())
    }

    async fn supervise(
        self: Arc<Self>,
        mut child: Child,
        pumps: OutputPumps,
        port: u16,
        probe: ReadinessProbe,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let pid = child.id();
        let readiness_timeout = self.options.readiness_timeout;

        let ready = tokio::select! {
            _ = &mut stop_rx => {
                self.shutdown(&mut child).await;
                return;
            }
            status = child.wait() => {
                self.record_exit(pid, status, pumps).await;
                return;
            }
            ready = timeout(readiness_timeout, probe.ready()) => ready.is_ok(),
        };

        if !ready {
            let err = SupervisorError::ReadinessTimeout {
                timeout: readiness_timeout,
                waiting_for: probe.describe(),
            };
            self.logs.push(format!("[perch] {err}"));
            self.fail(&err);
            self.shutdown(&mut child).await;
            return;
        }

        self.mark_running(port);

        tokio::select! {
            _ = &mut stop_rx => self.shutdown(&mut child).await,
            status = child.wait() => self.record_exit(pid, status, pumps).await,
        }
    }

    async fn shutdown(&self, child: &mut Child) {
        if let Err(e) = terminate(child, self.options.stop_grace).await {
            tracing::warn!(service = %self.key, "{}", e);
        }
    }

    fn mark_running(&self, port: u16) {
        let promoted = {
            let mut state = self.state.write();
            match *state {
                RunnerState::Starting { port: p, since } if p == port => {
                    *state = RunnerState::Running { port, since };
                    true
                }
                _ => false,
            }
        };
        if promoted {
            tracing::info!(service = %self.key, port, "Service ready");
            self.emit(Status::Running);
        }
    }

    /// Kill leftovers, let the final output land, then log the exit so the
    /// marker is always the last line.
    async fn record_exit(&self, pid: Option<u32>, status: io::Result<ExitStatus>, pumps: OutputPumps) {
        if let Some(pid) = pid {
            // Leftovers in the group would keep the port bound.
            signal_group(pid, libc::SIGKILL);
        }
        pumps.drain(OUTPUT_DRAIN_TIMEOUT).await;

        match status {
            Ok(status) if status.success() => {
                self.logs.push("[perch] process exited (exit code 0)");
                tracing::info!(service = %self.key, "Service exited cleanly");
                self.set_state(RunnerState::Idle);
            }
            Ok(status) => {
                let reason = describe_exit(&status);
                self.logs.push(format!("[perch] process exited ({reason})"));
                self.fail(&SupervisorError::Crash(reason));
            }
            Err(e) => {
                self.fail(&SupervisorError::Crash(format!("unknown status ({e})")));
            }
        }
    }

    fn fail(&self, err: &SupervisorError) {
        tracing::warn!(service = %self.key, "{}", err);
        self.set_state(RunnerState::Failed {
            error: err.to_string(),
        });
    }

    fn set_state(&self, next: RunnerState) {
        let status = next.status();
        let changed = {
            let mut state = self.state.write();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.emit(status);
        }
    }

    fn emit(&self, status: Status) {
        let event = RunnerEvent {
            service: self.key.clone(),
            status,
        };
        if let Err(e) = self.events.try_send(event) {
            // Periodic refresh will catch up.
            tracing::debug!(service = %self.key, error = %e, "Dropped runner event");
        }
    }
}
