//! Health monitor — periodic checks and automatic recovery of the worker.
//!
//! Each check takes a snapshot of the worker, folds it into the
//! [`HealthTracker`], and when recovery is due spawns the recovery
//! sequence:
//!
//! ```text
//! resume ── step_delay ── restart ── step_delay ── request work
//!                                                      │
//!                                   follow_up ── confirmation check
//! ```
//!
//! Every step is skipped once the worker is being shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use corelend_core::{
    HealthConfig, HealthIssue, HealthIssueKind, Notification, Notifier, WorkerState, epoch_secs,
};
use corelend_worker::WorkerSupervisor;

use crate::checker::{
    BlockReason, CheckOutcome, HealthStatus, HealthTracker, IssueLog, RecoveryState, assess,
    summarize,
};

/// What the monitor needs from the thing it keeps alive.
#[async_trait]
pub trait Recoverable: Send + Sync {
    fn worker_state(&self) -> WorkerState;

    fn is_shutting_down(&self) -> bool;

    /// Undo a pause the worker may be stuck in.
    async fn resume(&self) -> bool;

    async fn restart(&self) -> bool;

    async fn request_work(&self) -> bool;
}

#[async_trait]
impl Recoverable for WorkerSupervisor {
    fn worker_state(&self) -> WorkerState {
        self.state()
    }

    fn is_shutting_down(&self) -> bool {
        WorkerSupervisor::is_shutting_down(self)
    }

    async fn resume(&self) -> bool {
        self.force_unpause().await
    }

    async fn restart(&self) -> bool {
        WorkerSupervisor::restart(self).await
    }

    async fn request_work(&self) -> bool {
        WorkerSupervisor::request_work(self).await
    }
}

/// Snapshot served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub auto_recovery: bool,
    pub consecutive_failed_checks: u32,
    pub max_recovery_attempts: u32,
    pub recovery: RecoveryState,
    /// Unix timestamp (seconds) of the last completed check.
    pub last_check: Option<u64>,
    /// Conditions found by the last check, empty when healthy.
    pub conditions: Vec<String>,
    pub recent_issues: Vec<HealthIssue>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    config: HealthConfig,
    target: Arc<dyn Recoverable>,
    notifier: Arc<dyn Notifier>,
    tracker: Mutex<HealthTracker>,
    issues: Mutex<IssueLog>,
    last: Mutex<LastCheck>,
    auto_recovery: AtomicBool,
    follow_up: Notify,
}

#[derive(Default)]
struct LastCheck {
    at: Option<u64>,
    conditions: Vec<String>,
    blocked: Option<BlockReason>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        target: Arc<dyn Recoverable>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let tracker = HealthTracker::new(
            config.recovery_threshold,
            config.max_recovery_attempts,
            config.cooldown(),
        );
        Self {
            inner: Arc::new(Inner {
                auto_recovery: AtomicBool::new(config.auto_recovery),
                config,
                target,
                notifier,
                tracker: Mutex::new(tracker),
                issues: Mutex::new(IssueLog::default()),
                last: Mutex::new(LastCheck::default()),
                follow_up: Notify::new(),
            }),
        }
    }

    /// Run one check. A due recovery runs in the background.
    pub async fn check(&self) -> CheckOutcome {
        let inner = &self.inner;
        if inner.target.is_shutting_down() {
            debug!("worker shutting down, health check skipped");
            return CheckOutcome::Skipped;
        }

        let state = inner.target.worker_state();
        let Some(conditions) = assess(
            &state,
            epoch_secs(),
            inner.config.stalled_threshold(),
            inner.config.failure_threshold,
        ) else {
            debug!("worker stopped, health check skipped");
            return CheckOutcome::Skipped;
        };
        let auto_recovery = inner.auto_recovery.load(Ordering::SeqCst);
        let outcome = lock(&inner.tracker).record(&conditions, Instant::now(), auto_recovery);

        {
            let mut issues = lock(&inner.issues);
            for condition in &conditions {
                issues.push(condition.kind(), condition.to_string());
            }
        }

        let previous_block = {
            let mut last = lock(&inner.last);
            last.at = Some(epoch_secs());
            last.conditions = conditions.iter().map(ToString::to_string).collect();
            let previous = last.blocked;
            last.blocked = match outcome {
                CheckOutcome::Blocked { reason, .. } => Some(reason),
                CheckOutcome::Exhausted { .. } => Some(BlockReason::Suppressed),
                _ => None,
            };
            previous
        };

        match &outcome {
            CheckOutcome::Healthy | CheckOutcome::Skipped => {}
            CheckOutcome::Recovered => {
                info!("worker healthy again");
                inner
                    .notifier
                    .notify(Notification::info("Worker recovered and is healthy again"));
            }
            CheckOutcome::Unhealthy { failed_checks } => {
                warn!(
                    failed_checks,
                    threshold = inner.config.recovery_threshold,
                    issues = %summarize(&conditions),
                    "worker unhealthy"
                );
            }
            CheckOutcome::Blocked {
                reason,
                failed_checks,
            } => {
                warn!(failed_checks, ?reason, issues = %summarize(&conditions), "worker unhealthy, recovery not attempted");
                if previous_block != Some(*reason) {
                    let why = match reason {
                        BlockReason::Disabled => "automatic recovery is disabled",
                        BlockReason::Cooldown => "recovery cooldown in effect",
                        BlockReason::Suppressed => "recovery attempts exhausted",
                    };
                    inner.notifier.notify(Notification::warning(format!(
                        "Worker unhealthy ({}), {why}",
                        summarize(&conditions)
                    )));
                }
            }
            CheckOutcome::Recover { attempt, last } => {
                let max = inner.config.max_recovery_attempts;
                let summary = summarize(&conditions);
                warn!(attempt, max, last, issues = %summary, "starting worker recovery");
                lock(&inner.issues).push(
                    HealthIssueKind::RecoveryAttempt,
                    format!("recovery attempt {attempt}/{max}: {summary}"),
                );
                inner.notifier.notify(Notification::warning(format!(
                    "Worker unhealthy ({summary}), recovery attempt {attempt}/{max}"
                )));
                tokio::spawn(recover(inner.clone()));
            }
            CheckOutcome::Exhausted {
                attempts,
                failed_checks,
            } => {
                let summary = summarize(&conditions);
                warn!(attempts, failed_checks, issues = %summary, "worker recovery exhausted");
                lock(&inner.issues).push(
                    HealthIssueKind::RecoverySuppressed,
                    format!("automatic recovery suppressed after {attempts} attempts"),
                );
                inner.notifier.notify(Notification::critical(format!(
                    "Worker still unhealthy ({summary}) after {attempts} recovery attempts, \
                     manual intervention required"
                )));
            }
        }
        outcome
    }

    pub fn report(&self) -> HealthReport {
        let inner = &self.inner;
        let (status, consecutive_failed_checks, recovery, max_recovery_attempts) = {
            let tracker = lock(&inner.tracker);
            (
                tracker.status(),
                tracker.consecutive_failed_checks(),
                tracker.recovery().clone(),
                tracker.max_attempts(),
            )
        };
        let (last_check, conditions) = {
            let last = lock(&inner.last);
            (last.at, last.conditions.clone())
        };
        HealthReport {
            status,
            auto_recovery: inner.auto_recovery.load(Ordering::SeqCst),
            consecutive_failed_checks,
            max_recovery_attempts,
            recovery,
            last_check,
            conditions,
            recent_issues: lock(&inner.issues).recent(),
        }
    }

    /// Clear suppression and the attempt counter.
    pub fn reset_recovery(&self) {
        lock(&self.inner.tracker).reset();
        lock(&self.inner.last).blocked = None;
        info!("health recovery state reset");
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        let was = self.inner.auto_recovery.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "automatic recovery toggled");
        }
    }

    pub fn auto_recovery(&self) -> bool {
        self.inner.auto_recovery.load(Ordering::SeqCst)
    }

    /// Check on every interval tick and after each recovery until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.interval();
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?period, "health monitor started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check().await;
                }
                _ = self.inner.follow_up.notified() => {
                    debug!("confirming recovery");
                    self.check().await;
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RecoveryStep {
    Resume,
    Restart,
    RequestWork,
}

async fn recover(inner: Arc<Inner>) {
    let step_delay = inner.config.step_delay();
    let target = inner.target.as_ref();

    for (i, step) in [
        RecoveryStep::Resume,
        RecoveryStep::Restart,
        RecoveryStep::RequestWork,
    ]
    .into_iter()
    .enumerate()
    {
        if i > 0 {
            pause(step_delay).await;
        }
        if target.is_shutting_down() {
            debug!(?step, "worker shutting down, recovery aborted");
            return;
        }
        let ok = match step {
            RecoveryStep::Resume => target.resume().await,
            RecoveryStep::Restart => target.restart().await,
            RecoveryStep::RequestWork => target.request_work().await,
        };
        if !ok {
            warn!(?step, "recovery step failed");
        }
    }

    tokio::time::sleep(inner.config.follow_up()).await;
    if !target.is_shutting_down() {
        inner.follow_up.notify_one();
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
