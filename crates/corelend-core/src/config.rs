//! corelend.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below. Durations are written as strings (`"500ms"`, `"30s"`, `"5m"`,
//! `"1h"`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::{EnvironmentKind, ResourceLimits};

/// Errors raised while loading or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorelendConfig {
    pub environment: EnvironmentConfig,
    pub allocation: AllocationConfig,
    pub worker: WorkerConfig,
    pub load: LoadConfig,
    pub health: HealthConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Skip detection and treat the host as this kind.
    #[serde(rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_kind: Option<EnvironmentKind>,
}

// ── Allocation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    #[default]
    Dynamic,
    Tiered,
    Percentage,
}

/// User-declared core budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Cores on the machine. 0 = use the detected processor count.
    pub total_cores: u32,
    /// Cores always kept for the host application.
    pub reserved_cores: u32,
    pub mode: AllocationMode,
    /// Extra host cores needed per active load unit.
    pub cores_per_load_unit: f64,
    /// Floor on the host's share, regardless of load.
    pub min_cores_for_host: f64,
    /// Ceiling on the worker's share. 0 = use the environment's recommendation.
    pub max_cores_for_worker: u32,
    /// Allocations below this many cores pause the worker instead.
    pub pause_below_cores: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            total_cores: 0,
            reserved_cores: 1,
            mode: AllocationMode::Dynamic,
            cores_per_load_unit: 0.5,
            min_cores_for_host: 1.0,
            max_cores_for_worker: 0,
            pause_below_cores: 2,
        }
    }
}

/// A single self-healing edit applied during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCorrection {
    pub field: String,
    pub previous: String,
    pub corrected: String,
}

impl fmt::Display for ConfigCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation.{}: {} -> {}",
            self.field, self.previous, self.corrected
        )
    }
}

/// Result of validating an [`AllocationConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedAllocation {
    /// Fully resolved config (no auto values left) used by the allocator.
    pub config: AllocationConfig,
    /// The user's config with only the corrections applied; this is what
    /// gets written back to disk.
    pub persisted: AllocationConfig,
    pub corrections: Vec<ConfigCorrection>,
}

impl ValidatedAllocation {
    pub fn needs_persist(&self) -> bool {
        !self.corrections.is_empty()
    }
}

impl AllocationConfig {
    /// Validate against the host and its limits, producing a new config.
    ///
    /// Never fails: contradictions are corrected and reported.
    pub fn validate(&self, limits: &ResourceLimits, host_cores: u32) -> ValidatedAllocation {
        let mut resolved = self.clone();
        let mut persisted = self.clone();
        let mut corrections = Vec::new();

        if resolved.total_cores == 0 {
            resolved.total_cores = host_cores.max(1);
        }

        if resolved.reserved_cores >= resolved.total_cores {
            let fixed = resolved.total_cores.saturating_sub(1).max(1);
            if fixed != resolved.reserved_cores {
                corrections.push(ConfigCorrection {
                    field: "reserved_cores".to_string(),
                    previous: resolved.reserved_cores.to_string(),
                    corrected: fixed.to_string(),
                });
                resolved.reserved_cores = fixed;
                persisted.reserved_cores = fixed;
            }
        }

        // Negated comparisons also catch NaN.
        if !(resolved.cores_per_load_unit >= 0.0) {
            corrections.push(ConfigCorrection {
                field: "cores_per_load_unit".to_string(),
                previous: resolved.cores_per_load_unit.to_string(),
                corrected: "0".to_string(),
            });
            resolved.cores_per_load_unit = 0.0;
            persisted.cores_per_load_unit = 0.0;
        }

        if !(resolved.min_cores_for_host >= 0.0) {
            corrections.push(ConfigCorrection {
                field: "min_cores_for_host".to_string(),
                previous: resolved.min_cores_for_host.to_string(),
                corrected: "0".to_string(),
            });
            resolved.min_cores_for_host = 0.0;
            persisted.min_cores_for_host = 0.0;
        }

        if resolved.max_cores_for_worker == 0 {
            resolved.max_cores_for_worker = limits.recommended_cores;
        } else if resolved.max_cores_for_worker > limits.max_cores {
            if limits.strict {
                corrections.push(ConfigCorrection {
                    field: "max_cores_for_worker".to_string(),
                    previous: resolved.max_cores_for_worker.to_string(),
                    corrected: limits.max_cores.to_string(),
                });
                resolved.max_cores_for_worker = limits.max_cores;
                persisted.max_cores_for_worker = limits.max_cores;
            } else {
                warn!(
                    configured = resolved.max_cores_for_worker,
                    limit = limits.max_cores,
                    "max_cores_for_worker exceeds the environment limit"
                );
            }
        }

        for c in &corrections {
            warn!(correction = %c, "allocation config corrected");
        }

        ValidatedAllocation {
            config: resolved,
            persisted,
            corrections,
        }
    }
}

// ── Worker ─────────────────────────────────────────────────────────

/// Identity fields written into the worker's config artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerIdentity {
    pub user: String,
    pub team: String,
    pub passkey: String,
}

impl Default for WorkerIdentity {
    fn default() -> Self {
        Self {
            user: "Anonymous".to_string(),
            team: "0".to_string(),
            passkey: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable.
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Working directory; the config artifact lives here.
    pub work_dir: PathBuf,
    /// Artifact file name, relative to `work_dir`.
    pub config_file: String,
    pub identity: WorkerIdentity,
    /// Control port to ask the worker to listen on. None = file mode.
    pub control_port: Option<u16>,
    pub control_host: String,
    pub control_password: Option<String>,
    /// Addresses allowed on the control port.
    pub allow: Vec<String>,
    /// Marker that terminates every control-channel response.
    pub prompt: String,
    /// Log all worker output instead of only interesting lines.
    pub verbose: bool,
    /// Cores to launch with before the first allocation arrives.
    pub initial_cores: u32,
    /// File mode restarts the worker when the core delta exceeds this.
    pub restart_threshold: u32,
    pub settle_delay: String,
    /// Wait after spawning before dialling the control port.
    pub connect_delay: String,
    pub connect_timeout: String,
    pub read_timeout: String,
    pub shutdown_grace: String,
    pub kill_timeout: String,
    /// Unexpected exits restarted automatically before giving up.
    pub max_auto_restarts: u32,
    /// Uptime after which the automatic restart counter resets.
    pub stable_after: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("FAHClient"),
            args: Vec::new(),
            work_dir: PathBuf::from("worker"),
            config_file: "config.xml".to_string(),
            identity: WorkerIdentity::default(),
            control_port: Some(36330),
            control_host: "127.0.0.1".to_string(),
            control_password: None,
            allow: vec!["127.0.0.1".to_string()],
            prompt: "> ".to_string(),
            verbose: false,
            initial_cores: 2,
            restart_threshold: 2,
            settle_delay: "500ms".to_string(),
            connect_delay: "2s".to_string(),
            connect_timeout: "3s".to_string(),
            read_timeout: "5s".to_string(),
            shutdown_grace: "3s".to_string(),
            kill_timeout: "10s".to_string(),
            max_auto_restarts: 5,
            stable_after: "10m".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join(&self.config_file)
    }

    pub fn settle_delay(&self) -> Duration {
        parse_duration(&self.settle_delay).unwrap_or(Duration::from_millis(500))
    }

    pub fn connect_delay(&self) -> Duration {
        parse_duration(&self.connect_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(3))
    }

    pub fn read_timeout(&self) -> Duration {
        parse_duration(&self.read_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn shutdown_grace(&self) -> Duration {
        parse_duration(&self.shutdown_grace).unwrap_or(Duration::from_secs(3))
    }

    pub fn kill_timeout(&self) -> Duration {
        parse_duration(&self.kill_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn stable_after(&self) -> Duration {
        parse_duration(&self.stable_after).unwrap_or(Duration::from_secs(600))
    }
}

// ── Load monitor ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub interval: String,
    /// Load changes closer together than this are treated as a burst.
    pub grace_period: String,
    /// Below this performance sample the target is reduced.
    pub min_performance: f64,
    /// Value assumed when the host exposes no performance signal.
    pub nominal_performance: f64,
    /// Cores removed when performance is below `min_performance`.
    pub backpressure_step: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            grace_period: "10s".to_string(),
            min_performance: 18.0,
            nominal_performance: 20.0,
            backpressure_step: 1,
        }
    }
}

impl LoadConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn grace_period(&self) -> Duration {
        parse_duration(&self.grace_period).unwrap_or(Duration::from_secs(10))
    }
}

// ── Health monitor ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    /// No liveness update for this long counts as stalled.
    pub stalled_threshold: String,
    /// Worker-reported consecutive failures that count as unhealthy.
    pub failure_threshold: u32,
    /// Consecutive failed checks before recovery is attempted.
    pub recovery_threshold: u32,
    /// Minimum time between recovery attempts.
    pub cooldown: String,
    pub max_recovery_attempts: u32,
    pub auto_recovery: bool,
    /// Pause between the steps of a recovery sequence.
    pub step_delay: String,
    /// Delay before the confirmation check after a recovery.
    pub follow_up: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            stalled_threshold: "10m".to_string(),
            failure_threshold: 3,
            recovery_threshold: 3,
            cooldown: "5m".to_string(),
            max_recovery_attempts: 3,
            auto_recovery: true,
            step_delay: "5s".to_string(),
            follow_up: "30s".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn stalled_threshold(&self) -> Duration {
        parse_duration(&self.stalled_threshold).unwrap_or(Duration::from_secs(600))
    }

    pub fn cooldown(&self) -> Duration {
        parse_duration(&self.cooldown).unwrap_or(Duration::from_secs(300))
    }

    pub fn step_delay(&self) -> Duration {
        parse_duration(&self.step_delay).unwrap_or(Duration::from_secs(5))
    }

    pub fn follow_up(&self) -> Duration {
        parse_duration(&self.follow_up).unwrap_or(Duration::from_secs(30))
    }
}

// ── Admin API ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8470".to_string(),
        }
    }
}

impl CorelendConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let m = mins.trim().parse::<u64>().ok()?;
        m.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let h = hours.trim().parse::<u64>().ok()?;
        h.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
