//! corelend-core — shared types, configuration, and notifications.

pub mod config;
pub mod notify;
pub mod types;

pub use config::{
    AllocationConfig, AllocationMode, ApiConfig, ConfigCorrection, ConfigError, ConfigResult,
    CorelendConfig, EnvironmentConfig, HealthConfig, LoadConfig, ValidatedAllocation,
    WorkerConfig, WorkerIdentity, parse_duration,
};
pub use notify::{LogNotifier, Notification, Notifier, Severity};
pub use types::*;
