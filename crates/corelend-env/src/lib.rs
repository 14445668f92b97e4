//! corelend-env — hosting environment detection.
//!
//! Classifies the host once at startup and turns that classification plus
//! live capacity into [`ResourceLimits`](corelend_core::ResourceLimits).
//!
//! # Architecture
//!
//! ```text
//! EnvironmentProbe<H: HostView>
//!   ├── detect()        → Detection { kind, metadata }
//!   └── report()        → EnvironmentReport
//!         └── derive_limits(kind, metadata, cores, memory)
//! ```
//!
//! Every probe signal is optional. A host that hides everything ends up
//! as `DedicatedOrVps` (or `Unknown` when even the processor count is
//! unreadable), never as an error.

pub mod host;
pub mod limits;
pub mod probe;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use corelend_core::{EnvironmentKind, ResourceLimits};

pub use host::{HostView, SystemHost};
pub use limits::derive_limits;
pub use probe::{Detection, EnvironmentProbe};

/// Everything known about the host after startup detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentReport {
    pub kind: EnvironmentKind,
    pub metadata: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub host_cores: u32,
    pub host_memory_mb: u64,
}

impl<H: HostView> EnvironmentProbe<H> {
    /// Detect the environment and derive its limits.
    pub fn report(&self) -> EnvironmentReport {
        let Detection { kind, metadata } = self.detect();
        let host_cores = self.host().available_cores().unwrap_or(1).max(1);
        let host_memory_mb = self.host().memory_mb();
        let limits = derive_limits(kind, &metadata, host_cores, host_memory_mb);

        info!(
            kind = %kind,
            host_cores,
            host_memory_mb,
            max_cores = limits.max_cores,
            recommended_cores = limits.recommended_cores,
            strict = limits.strict,
            "environment detected"
        );

        EnvironmentReport {
            kind,
            metadata,
            limits,
            host_cores,
            host_memory_mb,
        }
    }
}
