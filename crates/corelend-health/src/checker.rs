//! Health assessment and the recovery state machine.
//!
//! Pure logic, no I/O: [`assess`] turns a worker snapshot into the list of
//! conditions that currently hold, and [`HealthTracker`] folds successive
//! assessments into a status and a recovery decision.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use corelend_core::{HealthIssue, HealthIssueKind, WorkerPhase, WorkerState, epoch_secs};

/// Capacity of the diagnostic issue ring.
pub const ISSUE_LOG_CAPACITY: usize = 50;

/// One reason the worker is considered unhealthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCondition {
    ProcessDown,
    Stalled { idle_secs: u64 },
    RepeatedFailures { count: u32 },
    AutoRestartSuppressed,
}

impl HealthCondition {
    pub fn kind(&self) -> HealthIssueKind {
        match self {
            HealthCondition::ProcessDown => HealthIssueKind::ProcessDown,
            HealthCondition::Stalled { .. } => HealthIssueKind::Stalled,
            HealthCondition::RepeatedFailures { .. } => HealthIssueKind::RepeatedFailures,
            HealthCondition::AutoRestartSuppressed => HealthIssueKind::AutoRestartSuppressed,
        }
    }
}

impl fmt::Display for HealthCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCondition::ProcessDown => f.write_str("worker process not running"),
            HealthCondition::Stalled { idle_secs } => {
                write!(f, "no worker activity for {idle_secs}s")
            }
            HealthCondition::RepeatedFailures { count } => {
                write!(f, "{count} consecutive worker failures")
            }
            HealthCondition::AutoRestartSuppressed => {
                f.write_str("worker auto-restart suppressed")
            }
        }
    }
}

/// Evaluate every condition independently.
///
/// Returns `None` for a worker that was stopped on purpose (phase
/// `Stopped`): it is neither healthy nor unhealthy. A paused worker is
/// silent by design and is never considered stalled.
pub fn assess(
    state: &WorkerState,
    now_secs: u64,
    stalled_threshold: Duration,
    failure_threshold: u32,
) -> Option<Vec<HealthCondition>> {
    if state.phase == WorkerPhase::Stopped {
        return None;
    }

    let mut conditions = Vec::new();
    if !state.process_alive {
        conditions.push(HealthCondition::ProcessDown);
    }
    if state.last_live_update > 0 && !state.is_paused() {
        let idle_secs = now_secs.saturating_sub(state.last_live_update);
        if idle_secs >= stalled_threshold.as_secs() {
            conditions.push(HealthCondition::Stalled { idle_secs });
        }
    }
    if failure_threshold > 0 && state.consecutive_failures >= failure_threshold {
        conditions.push(HealthCondition::RepeatedFailures {
            count: state.consecutive_failures,
        });
    }
    if state.auto_restart_suppressed {
        conditions.push(HealthCondition::AutoRestartSuppressed);
    }
    Some(conditions)
}

/// One-line summary of every condition.
pub fn summarize(conditions: &[HealthCondition]) -> String {
    conditions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Recovering,
    Suppressed,
}

/// Bookkeeping for automatic recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryState {
    pub attempts: u32,
    /// Unix timestamp (seconds) of the last attempt.
    pub last_attempt: Option<u64>,
    /// No further attempts until an explicit reset.
    pub suppressed: bool,
}

/// Why a due recovery did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Disabled,
    Cooldown,
    Suppressed,
}

/// Result of folding one check into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The check did not run (worker stopped or stopping).
    Skipped,
    Healthy,
    /// First healthy check after a bad spell.
    Recovered,
    /// Unhealthy, recovery threshold not reached yet.
    Unhealthy { failed_checks: u32 },
    /// Recovery is due but not allowed.
    Blocked { reason: BlockReason, failed_checks: u32 },
    /// Start recovery attempt number `attempt`.
    Recover { attempt: u32, last: bool },
    /// Recovery is due again but every attempt has been used. Returned once;
    /// later checks are `Blocked` with [`BlockReason::Suppressed`].
    Exhausted { attempts: u32, failed_checks: u32 },
}

/// Consecutive failed checks and recovery attempts for the worker.
#[derive(Debug)]
pub struct HealthTracker {
    healthy: bool,
    recovering: bool,
    consecutive_failed_checks: u32,
    recovery: RecoveryState,
    last_attempt_at: Option<Instant>,
    recovery_threshold: u32,
    max_attempts: u32,
    cooldown: Duration,
}

impl HealthTracker {
    pub fn new(recovery_threshold: u32, max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            healthy: true,
            recovering: false,
            consecutive_failed_checks: 0,
            recovery: RecoveryState::default(),
            last_attempt_at: None,
            recovery_threshold: recovery_threshold.max(1),
            max_attempts: max_attempts.max(1),
            cooldown,
        }
    }

    /// Fold one assessment in.
    pub fn record(
        &mut self,
        conditions: &[HealthCondition],
        now: Instant,
        auto_recovery: bool,
    ) -> CheckOutcome {
        if conditions.is_empty() {
            self.consecutive_failed_checks = 0;
            self.recovering = false;
            if self.healthy {
                return CheckOutcome::Healthy;
            }
            self.healthy = true;
            self.recovery.attempts = 0;
            self.recovery.suppressed = false;
            debug!("worker back to healthy");
            return CheckOutcome::Recovered;
        }

        self.healthy = false;
        self.consecutive_failed_checks += 1;
        let failed_checks = self.consecutive_failed_checks;

        if failed_checks < self.recovery_threshold {
            return CheckOutcome::Unhealthy { failed_checks };
        }
        if !auto_recovery {
            return CheckOutcome::Blocked {
                reason: BlockReason::Disabled,
                failed_checks,
            };
        }
        if self.recovery.suppressed {
            return CheckOutcome::Blocked {
                reason: BlockReason::Suppressed,
                failed_checks,
            };
        }
        if let Some(last) = self.last_attempt_at
            && now.saturating_duration_since(last) < self.cooldown
        {
            return CheckOutcome::Blocked {
                reason: BlockReason::Cooldown,
                failed_checks,
            };
        }

        self.recovering = false;
        if self.recovery.attempts >= self.max_attempts {
            self.recovery.suppressed = true;
            warn!(
                attempts = self.recovery.attempts,
                "automatic recovery exhausted, further recovery suppressed"
            );
            return CheckOutcome::Exhausted {
                attempts: self.recovery.attempts,
                failed_checks,
            };
        }

        self.recovery.attempts += 1;
        self.recovery.last_attempt = Some(epoch_secs());
        self.last_attempt_at = Some(now);
        self.recovering = true;

        CheckOutcome::Recover {
            attempt: self.recovery.attempts,
            last: self.recovery.attempts >= self.max_attempts,
        }
    }

    /// Clear suppression and the attempt counter.
    pub fn reset(&mut self) {
        self.recovery = RecoveryState::default();
        self.last_attempt_at = None;
    }

    pub fn status(&self) -> HealthStatus {
        if self.recovery.suppressed && !self.healthy {
            HealthStatus::Suppressed
        } else if self.recovering {
            HealthStatus::Recovering
        } else if self.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn consecutive_failed_checks(&self) -> u32 {
        self.consecutive_failed_checks
    }

    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

// ── Issue log ──────────────────────────────────────────────────────

/// Bounded ring of recent issues, oldest first.
#[derive(Debug)]
pub struct IssueLog {
    entries: VecDeque<HealthIssue>,
    capacity: usize,
}

impl Default for IssueLog {
    fn default() -> Self {
        Self::with_capacity(ISSUE_LOG_CAPACITY)
    }
}

impl IssueLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, kind: HealthIssueKind, description: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HealthIssue {
            kind,
            description: description.into(),
            timestamp: epoch_secs(),
        });
    }

    pub fn recent(&self) -> Vec<HealthIssue> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelend_core::ControlMode;

    const STALLED: Duration = Duration::from_secs(600);

    fn running(now: u64) -> WorkerState {
        let mut state = WorkerState::stopped(ControlMode::Channel);
        state.phase = WorkerPhase::Running;
        state.process_alive = true;
        state.current_cores = 2;
        state.last_live_update = now;
        state
    }

    #[test]
    fn healthy_worker_has_no_conditions() {
        assert_eq!(assess(&running(1000), 1000, STALLED, 3), Some(Vec::new()));
    }

    #[test]
    fn stopped_worker_is_not_judged() {
        let mut state = running(1);
        state.phase = WorkerPhase::Stopped;
        state.process_alive = false;
        assert_eq!(assess(&state, 10_000, STALLED, 3), None);
    }

    #[test]
    fn paused_worker_is_not_stalled() {
        let mut state = running(1000);
        state.current_cores = 0;
        assert_eq!(assess(&state, 1660, STALLED, 3), Some(Vec::new()));

        // A paused worker that died is still down.
        state.process_alive = false;
        assert_eq!(
            assess(&state, 1660, STALLED, 3),
            Some(vec![HealthCondition::ProcessDown])
        );
    }

    #[test]
    fn every_condition_is_reported() {
        let mut state = running(1000);
        state.process_alive = false;
        state.consecutive_failures = 4;
        state.auto_restart_suppressed = true;
        let conditions = assess(&state, 1700, STALLED, 3).unwrap();
        assert_eq!(
            conditions,
            vec![
                HealthCondition::ProcessDown,
                HealthCondition::Stalled { idle_secs: 700 },
                HealthCondition::RepeatedFailures { count: 4 },
                HealthCondition::AutoRestartSuppressed,
            ]
        );
        assert_eq!(
            summarize(&conditions),
            "worker process not running; no worker activity for 700s; \
             4 consecutive worker failures; worker auto-restart suppressed"
        );
    }

    #[test]
    fn recovery_after_threshold_then_cooldown() {
        let mut tracker = HealthTracker::new(3, 3, Duration::from_secs(300));
        let down = [HealthCondition::ProcessDown];
        let t0 = Instant::now();

        assert_eq!(
            tracker.record(&down, t0, true),
            CheckOutcome::Unhealthy { failed_checks: 1 }
        );
        assert_eq!(
            tracker.record(&down, t0, true),
            CheckOutcome::Unhealthy { failed_checks: 2 }
        );
        assert_eq!(
            tracker.record(&down, t0, true),
            CheckOutcome::Recover {
                attempt: 1,
                last: false
            }
        );
        assert_eq!(tracker.status(), HealthStatus::Recovering);
        assert_eq!(
            tracker.record(&down, t0 + Duration::from_secs(60), true),
            CheckOutcome::Blocked {
                reason: BlockReason::Cooldown,
                failed_checks: 4
            }
        );
        assert_eq!(
            tracker.record(&down, t0 + Duration::from_secs(300), true),
            CheckOutcome::Recover {
                attempt: 2,
                last: false
            }
        );
    }

    #[test]
    fn attempts_are_bounded() {
        let mut tracker = HealthTracker::new(1, 2, Duration::ZERO);
        let down = [HealthCondition::ProcessDown];
        let now = Instant::now();

        assert!(matches!(
            tracker.record(&down, now, true),
            CheckOutcome::Recover { attempt: 1, last: false }
        ));
        assert!(matches!(
            tracker.record(&down, now, true),
            CheckOutcome::Recover { attempt: 2, last: true }
        ));
        // The last attempt may still work out.
        assert!(!tracker.recovery().suppressed);
        assert_eq!(tracker.status(), HealthStatus::Recovering);

        assert_eq!(
            tracker.record(&down, now, true),
            CheckOutcome::Exhausted {
                attempts: 2,
                failed_checks: 3
            }
        );
        assert!(tracker.recovery().suppressed);
        assert_eq!(tracker.status(), HealthStatus::Suppressed);

        for _ in 0..5 {
            assert!(matches!(
                tracker.record(&down, now, true),
                CheckOutcome::Blocked {
                    reason: BlockReason::Suppressed,
                    ..
                }
            ));
        }

        tracker.reset();
        assert!(matches!(
            tracker.record(&down, now, true),
            CheckOutcome::Recover { attempt: 1, .. }
        ));
    }

    #[test]
    fn healthy_check_resets_attempts() {
        let mut tracker = HealthTracker::new(1, 3, Duration::ZERO);
        let now = Instant::now();
        tracker.record(&[HealthCondition::ProcessDown], now, true);
        assert_eq!(tracker.recovery().attempts, 1);

        assert_eq!(tracker.record(&[], now, true), CheckOutcome::Recovered);
        assert_eq!(tracker.recovery().attempts, 0);
        assert_eq!(tracker.consecutive_failed_checks(), 0);
        assert_eq!(tracker.record(&[], now, true), CheckOutcome::Healthy);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
    }

    #[test]
    fn successful_last_attempt_keeps_recovery_available() {
        let mut tracker = HealthTracker::new(1, 3, Duration::ZERO);
        let down = [HealthCondition::ProcessDown];
        let now = Instant::now();

        for attempt in 1..=3 {
            assert_eq!(
                tracker.record(&down, now, true),
                CheckOutcome::Recover {
                    attempt,
                    last: attempt == 3
                }
            );
        }
        assert_eq!(tracker.record(&[], now, true), CheckOutcome::Recovered);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.recovery().attempts, 0);
        assert!(!tracker.recovery().suppressed);

        assert_eq!(
            tracker.record(&down, now, true),
            CheckOutcome::Recover {
                attempt: 1,
                last: false
            }
        );
    }

    #[test]
    fn exhaustion_waits_for_cooldown() {
        let mut tracker = HealthTracker::new(1, 1, Duration::from_secs(300));
        let down = [HealthCondition::ProcessDown];
        let t0 = Instant::now();

        assert!(matches!(
            tracker.record(&down, t0, true),
            CheckOutcome::Recover { attempt: 1, last: true }
        ));
        assert!(matches!(
            tracker.record(&down, t0 + Duration::from_secs(60), true),
            CheckOutcome::Blocked {
                reason: BlockReason::Cooldown,
                ..
            }
        ));
        assert!(matches!(
            tracker.record(&down, t0 + Duration::from_secs(300), true),
            CheckOutcome::Exhausted { attempts: 1, .. }
        ));
    }

    #[test]
    fn disabled_recovery_only_reports() {
        let mut tracker = HealthTracker::new(1, 3, Duration::ZERO);
        assert_eq!(
            tracker.record(&[HealthCondition::ProcessDown], Instant::now(), false),
            CheckOutcome::Blocked {
                reason: BlockReason::Disabled,
                failed_checks: 1
            }
        );
        assert_eq!(tracker.recovery().attempts, 0);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn issue_log_keeps_most_recent() {
        let mut log = IssueLog::default();
        for i in 0..(ISSUE_LOG_CAPACITY + 10) {
            log.push(HealthIssueKind::Stalled, format!("issue {i}"));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), ISSUE_LOG_CAPACITY);
        assert_eq!(recent[0].description, "issue 10");
        assert_eq!(
            recent.last().unwrap().description,
            format!("issue {}", ISSUE_LOG_CAPACITY + 9)
        );
    }
}
