//! Resource ceilings per environment kind.

use std::collections::BTreeMap;

use corelend_core::{EnvironmentKind, ResourceLimits};

use crate::probe::{META_CPU_QUOTA, META_DECLARED_MEMORY, META_MEMORY_LIMIT};

/// Memory ceiling assumed for shared hosting accounts.
pub const SHARED_HOSTING_MEMORY_MB: u64 = 512;

/// Derive conservative limits for a classified host.
///
/// | Kind | max | recommended | strict |
/// |---|---|---|---|
/// | ConstrainedPanel | cores-1 | cores/2 | yes |
/// | Container | cores-1 | 0.7·cores | yes |
/// | SharedHosting | 1 | 1 | yes |
/// | DedicatedOrVps | cores-1 | 0.8·cores | no |
/// | Unknown | cores-1 | cores/2 | yes |
///
/// A container CPU quota lowers the effective core count first. Every
/// count floors at 1 and `recommended <= max <= host_cores` always holds.
pub fn derive_limits(
    kind: EnvironmentKind,
    metadata: &BTreeMap<String, String>,
    host_cores: u32,
    host_memory_mb: u64,
) -> ResourceLimits {
    let host_cores = host_cores.max(1);
    let cores = match meta_u64(metadata, META_CPU_QUOTA) {
        Some(quota) if quota > 0 => host_cores.min(quota as u32),
        _ => host_cores,
    };
    let all_but_one = cores.saturating_sub(1);

    let (max_cores, recommended, max_memory_mb, strict) = match kind {
        EnvironmentKind::ConstrainedPanel => (
            all_but_one,
            cores / 2,
            cap_memory(host_memory_mb, meta_u64(metadata, META_DECLARED_MEMORY)),
            true,
        ),
        EnvironmentKind::Container => (
            all_but_one,
            (f64::from(cores) * 0.7) as u32,
            cap_memory(host_memory_mb, meta_u64(metadata, META_MEMORY_LIMIT)),
            true,
        ),
        EnvironmentKind::SharedHosting => (
            1,
            1,
            cap_memory(host_memory_mb, Some(SHARED_HOSTING_MEMORY_MB)),
            true,
        ),
        EnvironmentKind::DedicatedOrVps => (
            all_but_one,
            (f64::from(cores) * 0.8) as u32,
            host_memory_mb,
            false,
        ),
        EnvironmentKind::Unknown => (all_but_one, cores / 2, host_memory_mb, true),
    };

    let max_cores = max_cores.clamp(1, host_cores);
    let recommended_cores = recommended.clamp(1, max_cores);

    ResourceLimits {
        max_cores,
        recommended_cores,
        max_memory_mb,
        strict,
    }
}

fn meta_u64(metadata: &BTreeMap<String, String>, key: &str) -> Option<u64> {
    metadata.get(key).and_then(|v| v.parse::<u64>().ok())
}

/// Lower of host memory and a ceiling; an unknown host (0) takes the ceiling.
fn cap_memory(host_mb: u64, ceiling: Option<u64>) -> u64 {
    match (host_mb, ceiling) {
        (0, Some(limit)) => limit,
        (host, Some(limit)) => host.min(limit),
        (host, None) => host,
    }
}
