//! corelend-health — worker health checks and automatic recovery.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (interval tick / follow-up)
//!   ├── Recoverable::worker_state() → WorkerState snapshot
//!   ├── assess() → [HealthCondition]
//!   ├── HealthTracker::record() → CheckOutcome
//!   │     threshold ─ auto_recovery ─ suppression ─ cooldown
//!   ├── IssueLog (last 50 issues)
//!   └── recovery task: resume → restart → request work → follow-up check
//! ```
//!
//! Recovery attempts are bounded by `max_recovery_attempts`. When recovery
//! is due again after the last attempt, the monitor pages once and then
//! only reports until [`HealthMonitor::reset_recovery`] is called or the
//! worker turns healthy.

pub mod checker;
pub mod monitor;

pub use checker::{
    BlockReason, CheckOutcome, HealthCondition, HealthStatus, HealthTracker, IssueLog,
    RecoveryState, assess,
};
pub use monitor::{HealthMonitor, HealthReport, Recoverable};
