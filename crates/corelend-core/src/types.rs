//! Shared types used across corelend crates.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Environment ────────────────────────────────────────────────────

/// Classification of the host the daemon is running on.
///
/// Determined once at startup and never changes for the life of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// Game/server panel (Pterodactyl and friends) with tight quotas.
    ConstrainedPanel,
    /// Docker, Kubernetes, LXC, Podman.
    Container,
    /// Shared web hosting account.
    SharedHosting,
    /// A machine we effectively own.
    DedicatedOrVps,
    /// Host capacity could not be read.
    Unknown,
}

impl EnvironmentKind {
    pub fn label(&self) -> &'static str {
        match self {
            EnvironmentKind::ConstrainedPanel => "constrained-panel",
            EnvironmentKind::Container => "container",
            EnvironmentKind::SharedHosting => "shared-hosting",
            EnvironmentKind::DedicatedOrVps => "dedicated-or-vps",
            EnvironmentKind::Unknown => "unknown",
        }
    }

    /// Whether the worker may open a local control port on this host.
    ///
    /// Panels and shared hosts only expose the ports they hand out, so the
    /// worker is driven through its config file instead.
    pub fn permits_control_port(&self) -> bool {
        !matches!(
            self,
            EnvironmentKind::ConstrainedPanel | EnvironmentKind::SharedHosting
        )
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Hard resource ceilings derived from the environment and host capacity.
///
/// Invariant: `0 < recommended_cores <= max_cores <= host cores`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_cores: u32,
    pub recommended_cores: u32,
    pub max_memory_mb: u64,
    /// Strict hosts never let user config exceed `max_cores`.
    pub strict: bool,
}

// ── Worker ─────────────────────────────────────────────────────────

/// Outer lifecycle phase of the managed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How core allocations reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Live commands over the worker's control socket.
    Channel,
    /// Config file rewrite plus restart.
    File,
}

/// Observable state of the worker, published by the supervisor.
///
/// Only the supervisor task writes this; every other component reads a
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub phase: WorkerPhase,
    pub mode: ControlMode,
    pub process_alive: bool,
    pub channel_connected: bool,
    pub pid: Option<u32>,
    /// Cores the worker is currently believed to run with (0 = paused).
    pub current_cores: u32,
    /// Unix timestamp (seconds) of the last sign of life from the worker.
    pub last_live_update: u64,
    /// Failures reported by the worker's own output since the last success.
    pub consecutive_failures: u32,
    /// The supervisor gave up restarting a crashing worker on its own.
    pub auto_restart_suppressed: bool,
    /// Automatic restarts since the last manual start.
    pub restarts: u32,
}

impl WorkerState {
    /// Initial state for a supervisor that has not started anything yet.
    pub fn stopped(mode: ControlMode) -> Self {
        Self {
            phase: WorkerPhase::Stopped,
            mode,
            process_alive: false,
            channel_connected: false,
            pid: None,
            current_cores: 0,
            last_live_update: 0,
            consecutive_failures: 0,
            auto_restart_suppressed: false,
            restarts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process_alive && self.phase == WorkerPhase::Running
    }

    /// Alive but parked at zero cores on purpose, so it has no reason to
    /// produce output.
    pub fn is_paused(&self) -> bool {
        self.is_running() && self.current_cores == 0
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// Category of a recorded health issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    ProcessDown,
    Stalled,
    RepeatedFailures,
    AutoRestartSuppressed,
    RecoveryAttempt,
    RecoverySuppressed,
}

/// A single diagnostic entry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub kind: HealthIssueKind,
    pub description: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_port_policy() {
        assert!(EnvironmentKind::Container.permits_control_port());
        assert!(EnvironmentKind::DedicatedOrVps.permits_control_port());
        assert!(EnvironmentKind::Unknown.permits_control_port());
        assert!(!EnvironmentKind::ConstrainedPanel.permits_control_port());
        assert!(!EnvironmentKind::SharedHosting.permits_control_port());
    }

    #[test]
    fn stopped_state_is_not_running() {
        let state = WorkerState::stopped(ControlMode::Channel);
        assert!(!state.is_running());
        assert_eq!(state.current_cores, 0);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = toml::to_string(&Wrapper {
            kind: EnvironmentKind::DedicatedOrVps,
        })
        .unwrap();
        assert!(s.contains("dedicated_or_vps"));
    }

    #[derive(Serialize)]
    struct Wrapper {
        kind: EnvironmentKind,
    }
}
