//! Worker supervisor.
//!
//! A single task owns the worker process and its control channel. Callers
//! hold a cheap [`WorkerSupervisor`] handle, send it commands over an
//! `mpsc` queue and get `oneshot` replies, and read [`WorkerState`]
//! through a `watch` channel. Because every mutation runs inside the task,
//! no two core changes can interleave.
//!
//! Besides commands, the task wakes every [`WATCH_INTERVAL`] to notice
//! unexpected exits and restart the worker with exponential backoff, up to
//! `max_auto_restarts` times.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use corelend_core::{
    ControlMode, LogNotifier, Notification, Notifier, WorkerConfig, WorkerPhase, WorkerState,
};

use crate::artifact::WorkerArtifact;
use crate::channel::{ControlChannel, FileChannel, SocketChannel};
use crate::process::{LaunchSpec, Liveness, WorkerProcess};
use crate::protocol::ControlCommand;

/// How often the supervisor checks on the worker process.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(2);

const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(10);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Delay before automatic restart number `attempt + 1`.
pub fn restart_backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    RESTART_BACKOFF_BASE
        .saturating_mul(factor)
        .min(RESTART_BACKOFF_CAP)
}

enum Command {
    Start(oneshot::Sender<bool>),
    ForceStart(oneshot::Sender<bool>),
    SetCores(u32, oneshot::Sender<bool>),
    ForceUnpause(oneshot::Sender<bool>),
    RequestWork(oneshot::Sender<bool>),
    Restart(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

// ── Handle ─────────────────────────────────────────────────────────

/// Handle to the supervisor task. Clones share the same worker.
#[derive(Clone)]
pub struct WorkerSupervisor {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<WorkerState>,
    stop_requested: Arc<AtomicBool>,
}

impl WorkerSupervisor {
    /// Spawn the supervisor task. Nothing is launched until [`start`].
    ///
    /// Channel mode is used when a control port is configured and the host
    /// permits one; otherwise the worker is driven through its config file.
    ///
    /// [`start`]: WorkerSupervisor::start
    pub fn spawn(config: WorkerConfig, control_permitted: bool) -> Self {
        Self::spawn_with_notifier(config, control_permitted, Arc::new(LogNotifier))
    }

    /// Like [`spawn`](WorkerSupervisor::spawn), reporting switches between
    /// the control channel and the config file to `notifier`.
    pub fn spawn_with_notifier(
        config: WorkerConfig,
        control_permitted: bool,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let control: Box<dyn ControlChannel> = match (control_permitted, config.control_port) {
            (true, Some(port)) => Box::new(SocketChannel::new(&config, port)),
            _ => Box::new(FileChannel::new(&config)),
        };
        let mode = control.mode();

        let (state_tx, state_rx) = watch::channel(WorkerState::stopped(mode));
        let (command_tx, command_rx) = mpsc::channel(32);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let liveness = Arc::new(Liveness::default());

        let task = SupervisorTask {
            process: WorkerProcess::new(LaunchSpec::from(&config), liveness.clone()),
            fallback: FileChannel::new(&config),
            target_cores: config.initial_cores,
            slot_cores: config.initial_cores,
            config,
            mode,
            control,
            liveness,
            state: state_tx,
            stop_requested: stop_requested.clone(),
            restart_at: None,
            notifier,
            on_fallback: false,
        };
        tokio::spawn(task.run(command_rx));

        info!(mode = ?mode, "worker supervisor started");
        Self {
            commands: command_tx,
            state: state_rx,
            stop_requested,
        }
    }

    async fn call(&self, make: impl FnOnce(oneshot::Sender<bool>) -> Command) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            warn!("worker supervisor is gone");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Write the config artifact, launch the worker and connect to it.
    pub async fn start(&self) -> bool {
        self.call(Command::Start).await
    }

    /// Move the worker to `cores` (0 pauses it).
    pub async fn set_cores(&self, cores: u32) -> bool {
        self.call(|reply| Command::SetCores(cores, reply)).await
    }

    pub async fn force_start(&self) -> bool {
        self.call(Command::ForceStart).await
    }

    pub async fn force_unpause(&self) -> bool {
        self.call(Command::ForceUnpause).await
    }

    /// Ask the worker to fetch new work. Always succeeds in file mode.
    pub async fn request_work(&self) -> bool {
        self.call(Command::RequestWork).await
    }

    /// Stop, reset failure bookkeeping, start again.
    pub async fn restart(&self) -> bool {
        self.call(Command::Restart).await
    }

    /// Stop the worker. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().channel_connected
    }

    pub fn mode(&self) -> ControlMode {
        self.state.borrow().mode
    }

    /// Whether a stop was requested and not yet undone by a start.
    pub fn is_shutting_down(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }
}

// ── Task ───────────────────────────────────────────────────────────

struct SupervisorTask {
    config: WorkerConfig,
    mode: ControlMode,
    control: Box<dyn ControlChannel>,
    fallback: FileChannel,
    process: WorkerProcess,
    liveness: Arc<Liveness>,
    state: watch::Sender<WorkerState>,
    stop_requested: Arc<AtomicBool>,
    /// Last allocation asked for, applied or not.
    target_cores: u32,
    /// Cores configured in the worker's slot, kept while paused.
    slot_cores: u32,
    restart_at: Option<Instant>,
    notifier: Arc<dyn Notifier>,
    /// Channel mode, but allocations currently go through the config file.
    on_fallback: bool,
}

impl SupervisorTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(WATCH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                }
                _ = tick.tick() => self.watch_process().await,
            }
        }

        debug!("all supervisor handles dropped, stopping worker");
        self.stop_worker().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::ForceStart(reply) => {
                info!("force start requested");
                let ok = self.start().await;
                if !ok {
                    warn!("force start failed");
                }
                let _ = reply.send(ok);
            }
            Command::SetCores(cores, reply) => {
                let _ = reply.send(self.set_cores(cores).await);
            }
            Command::ForceUnpause(reply) => {
                let ok = self.force_unpause().await;
                if !ok {
                    warn!("force unpause failed");
                }
                let _ = reply.send(ok);
            }
            Command::RequestWork(reply) => {
                let _ = reply.send(self.request_work().await);
            }
            Command::Restart(reply) => {
                let _ = reply.send(self.restart().await);
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Apply `update` and refresh the liveness fields in one notification.
    fn publish(&self, update: impl FnOnce(&mut WorkerState)) {
        let last_live = self.liveness.last_live();
        let failures = self.liveness.failures();
        self.state.send_modify(|state| {
            update(state);
            state.last_live_update = last_live;
            state.consecutive_failures = failures;
        });
    }

    fn snapshot(&self) -> WorkerState {
        self.state.borrow().clone()
    }

    fn launch_cores(&self) -> u32 {
        if self.target_cores > 0 {
            self.target_cores
        } else {
            self.config.initial_cores.max(1)
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    async fn start(&mut self) -> bool {
        self.stop_requested.store(false, Ordering::SeqCst);
        if self.process.is_running() {
            debug!("worker already running");
            return true;
        }

        self.restart_at = None;
        self.liveness.reset();
        self.publish(|s| {
            s.restarts = 0;
            s.auto_restart_suppressed = false;
        });
        self.launch(self.launch_cores()).await
    }

    /// Write the artifact and spawn. A failed launch leaves the phase at
    /// `Running` with no process so the watch loop retries it.
    async fn launch(&mut self, cores: u32) -> bool {
        let cores = cores.max(1);
        self.publish(|s| s.phase = WorkerPhase::Starting);

        let artifact =
            WorkerArtifact::from_config(&self.config, cores, self.mode == ControlMode::Channel);
        let spawned = artifact
            .write(&self.config.config_path())
            .and_then(|()| self.process.spawn());

        let pid = match spawned {
            Ok(pid) => pid,
            Err(e) => {
                error!(error = %e, "failed to start worker");
                self.publish(|s| {
                    s.phase = WorkerPhase::Running;
                    s.process_alive = false;
                    s.pid = None;
                    s.channel_connected = false;
                });
                return false;
            }
        };

        self.slot_cores = cores;
        self.publish(|s| {
            s.phase = WorkerPhase::Running;
            s.process_alive = true;
            s.pid = Some(pid);
            s.current_cores = cores;
            s.channel_connected = false;
        });
        info!(pid, cores, mode = ?self.mode, "worker started");

        if self.mode == ControlMode::Channel {
            tokio::time::sleep(self.config.connect_delay()).await;
            self.connect_control().await;
        }
        true
    }

    async fn connect_control(&mut self) -> bool {
        if let Err(e) = self.control.connect().await {
            warn!(error = %e, "control channel connect failed");
        }
        let connected = self.control.is_connected();
        self.publish(|s| s.channel_connected = connected);
        connected
    }

    async fn restart(&mut self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            info!("restart skipped, worker was stopped on request");
            return false;
        }
        info!("restarting worker");

        self.control.disconnect().await;
        self.process.terminate(self.config.kill_timeout()).await;
        self.liveness.reset();
        self.restart_at = None;
        self.publish(|s| {
            s.restarts = 0;
            s.auto_restart_suppressed = false;
            s.process_alive = false;
            s.pid = None;
            s.channel_connected = false;
        });
        self.launch(self.launch_cores()).await
    }

    async fn shutdown(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.target_cores = 0;
        self.restart_at = None;

        if self.snapshot().phase == WorkerPhase::Stopped && !self.process.is_running() {
            debug!("worker already stopped");
            return;
        }
        info!("stopping worker");
        self.publish(|s| s.phase = WorkerPhase::Stopping);

        if self.control.is_connected()
            && let Err(e) = self.control.send(ControlCommand::Pause).await
        {
            debug!(error = %e, "pause before shutdown failed");
        }
        tokio::time::sleep(self.config.shutdown_grace()).await;
        self.stop_worker().await;
    }

    async fn stop_worker(&mut self) {
        if self.control.is_connected()
            && let Err(e) = self.control.send(ControlCommand::Shutdown).await
        {
            debug!(error = %e, "shutdown command failed");
        }
        self.control.disconnect().await;

        let graceful = self.process.terminate(self.config.kill_timeout()).await;
        self.publish(|s| {
            s.phase = WorkerPhase::Stopped;
            s.process_alive = false;
            s.pid = None;
            s.channel_connected = false;
            s.current_cores = 0;
        });
        info!(graceful, "worker stopped");
    }

    // ── Allocation ─────────────────────────────────────────────────

    async fn set_cores(&mut self, cores: u32) -> bool {
        let state = self.snapshot();
        let previous = state.current_cores;
        self.target_cores = cores;

        if self.stop_requested.load(Ordering::SeqCst) {
            debug!(cores, "worker stopped on request, allocation recorded only");
            return false;
        }
        if cores == previous {
            debug!(cores, "allocation unchanged");
            return true;
        }

        if state.phase == WorkerPhase::Stopped {
            if cores == 0 {
                self.publish(|s| s.current_cores = 0);
                return true;
            }
            info!(cores, "starting paused worker");
            return self.launch(cores).await;
        }
        if !self.process.is_running() {
            debug!(cores, "worker is down, allocation deferred to the next launch");
            return false;
        }

        if self.mode == ControlMode::Channel
            && !self.control.is_connected()
            && !self.connect_control().await
        {
            warn!(cores, "control channel unreachable, applying through config file");
            self.enter_fallback("unreachable");
            return self.apply_file(previous, cores).await;
        }

        match self
            .control
            .apply_cores(&mut self.process, previous, cores)
            .await
        {
            Ok(()) => {
                if self.mode == ControlMode::Channel {
                    self.liveness.touch();
                    self.leave_fallback();
                }
                self.record_applied(previous, cores);
                true
            }
            Err(e) if self.mode == ControlMode::Channel && !self.control.is_connected() => {
                warn!(error = %e, cores, "control channel lost, applying through config file");
                self.enter_fallback("lost");
                self.apply_file(previous, cores).await
            }
            Err(e) => {
                warn!(error = %e, cores, "failed to apply core allocation");
                false
            }
        }
    }

    async fn apply_file(&mut self, previous: u32, cores: u32) -> bool {
        match self
            .fallback
            .apply_cores(&mut self.process, previous, cores)
            .await
        {
            Ok(()) => {
                self.record_applied(previous, cores);
                true
            }
            Err(e) => {
                warn!(error = %e, cores, "config file update failed");
                false
            }
        }
    }

    fn enter_fallback(&mut self, why: &str) {
        if self.on_fallback {
            return;
        }
        self.on_fallback = true;
        self.notifier.notify(Notification::warning(format!(
            "Control channel {why}, driving the worker through its config file"
        )));
    }

    fn leave_fallback(&mut self) {
        if !self.on_fallback {
            return;
        }
        self.on_fallback = false;
        info!("control channel restored");
        self.notifier.notify(Notification::info(
            "Control channel restored, core changes applied live again",
        ));
    }

    fn record_applied(&mut self, previous: u32, cores: u32) {
        if cores > 0 {
            self.slot_cores = cores;
        }
        let alive = self.process.is_running();
        let pid = self.process.pid();
        let connected = self.control.is_connected();
        self.publish(|s| {
            s.current_cores = cores;
            s.process_alive = alive;
            s.pid = pid;
            s.channel_connected = connected;
            if cores == 0 && !alive {
                s.phase = WorkerPhase::Stopped;
            }
        });
        info!(previous, cores, mode = ?self.mode, "core allocation applied");
    }

    async fn force_unpause(&mut self) -> bool {
        info!("force unpause requested");
        self.stop_requested.store(false, Ordering::SeqCst);

        if !self.process.is_running() {
            return self.start().await;
        }
        // A running file-mode worker is never paused.
        if self.mode == ControlMode::File {
            return true;
        }
        if !self.control.is_connected() && !self.connect_control().await {
            return false;
        }

        match self.control.send(ControlCommand::Unpause).await {
            Ok(_) => {
                self.liveness.touch();
                let cores = self.slot_cores.max(1);
                self.publish(|s| {
                    s.current_cores = cores;
                    s.channel_connected = true;
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "unpause failed");
                let connected = self.control.is_connected();
                self.publish(|s| s.channel_connected = connected);
                false
            }
        }
    }

    async fn request_work(&mut self) -> bool {
        if self.mode == ControlMode::File {
            debug!("request-work has no file-mode equivalent");
            return true;
        }
        if !self.process.is_running() {
            return false;
        }
        if !self.control.is_connected() && !self.connect_control().await {
            return false;
        }

        match self.control.send(ControlCommand::RequestWork).await {
            Ok(_) => {
                self.liveness.touch();
                true
            }
            Err(e) => {
                warn!(error = %e, "request-work failed");
                let connected = self.control.is_connected();
                self.publish(|s| s.channel_connected = connected);
                false
            }
        }
    }

    // ── Watch ──────────────────────────────────────────────────────

    async fn watch_process(&mut self) {
        let alive = self.process.is_running();
        let state = self.snapshot();

        if alive || state.phase != WorkerPhase::Running || self.stop_requested.load(Ordering::SeqCst)
        {
            let stable = self
                .process
                .uptime()
                .is_some_and(|uptime| uptime >= self.config.stable_after());
            if alive && stable && state.restarts > 0 {
                info!(restarts = state.restarts, "worker stable again, restart count cleared");
            }
            let pid = self.process.pid();
            self.publish(|s| {
                s.process_alive = alive;
                s.pid = pid;
                if alive && stable {
                    s.restarts = 0;
                }
            });
            return;
        }

        if state.auto_restart_suppressed {
            self.publish(|s| s.process_alive = false);
            return;
        }

        match self.restart_at {
            None => {
                self.control.disconnect().await;
                if state.restarts >= self.config.max_auto_restarts {
                    warn!(
                        restarts = state.restarts,
                        "worker keeps exiting, automatic restarts suppressed"
                    );
                    self.publish(|s| {
                        s.process_alive = false;
                        s.pid = None;
                        s.channel_connected = false;
                        s.auto_restart_suppressed = true;
                    });
                } else {
                    let delay = restart_backoff(state.restarts);
                    warn!(
                        attempt = state.restarts + 1,
                        delay_secs = delay.as_secs(),
                        "worker exited unexpectedly, restart scheduled"
                    );
                    self.restart_at = Some(Instant::now() + delay);
                    self.publish(|s| {
                        s.process_alive = false;
                        s.pid = None;
                        s.channel_connected = false;
                    });
                }
            }
            Some(at) if Instant::now() >= at => {
                self.restart_at = None;
                self.publish(|s| s.restarts += 1);
                if !self.launch(self.launch_cores()).await {
                    warn!("automatic restart failed");
                }
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(restart_backoff(0), Duration::from_secs(10));
        assert_eq!(restart_backoff(1), Duration::from_secs(20));
        assert_eq!(restart_backoff(2), Duration::from_secs(40));
        assert_eq!(restart_backoff(5), Duration::from_secs(300));
        assert_eq!(restart_backoff(u32::MAX), Duration::from_secs(300));
    }
}
