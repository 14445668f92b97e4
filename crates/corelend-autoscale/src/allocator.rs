//! Resource allocator — host load to worker core count.
//!
//! A pure function of the unit count, the allocation config and the
//! environment limits. No I/O, no state.

use std::sync::Once;

use tracing::debug;

use corelend_core::{AllocationConfig, AllocationMode, ResourceLimits};

static MODE_FALLBACK: Once = Once::new();

/// Cores the worker should get while the host serves `load_units` units.
///
/// ```text
/// needed_for_host = max(reserved + units * cores_per_unit, min_cores_for_host)
/// result          = clamp(floor(total - needed_for_host), 0, max_cores_for_worker)
/// result          = min(result, total - 1)
/// strict hosts    : result = min(result, limits.max_cores)
/// 0 < result < pause_below_cores → 0
/// ```
///
/// The last rule pauses the worker instead of granting it a core or two
/// that would mostly be spent on churn.
pub fn compute(load_units: u32, cfg: &AllocationConfig, limits: &ResourceLimits) -> u32 {
    if cfg.mode != AllocationMode::Dynamic {
        MODE_FALLBACK.call_once(|| {
            debug!(mode = ?cfg.mode, "allocation mode not implemented, using dynamic");
        });
    }

    let total = f64::from(cfg.total_cores);
    let demand = f64::from(cfg.reserved_cores) + f64::from(load_units) * cfg.cores_per_load_unit;
    let needed_for_host = demand.max(cfg.min_cores_for_host);
    let available = (total - needed_for_host).floor();

    let max_for_worker = match cfg.max_cores_for_worker {
        0 => limits.recommended_cores,
        n => n,
    };

    // NaN and negatives land on 0 here.
    let mut result = if available >= 1.0 {
        (available as u32).min(max_for_worker)
    } else {
        0
    };
    result = result.min(cfg.total_cores.saturating_sub(1));
    if limits.strict {
        result = result.min(limits.max_cores);
    }
    pause_marginal(result, cfg)
}

/// `0 < cores < pause_below_cores` becomes 0. Anything that lowers a
/// target after [`compute`] must pass it through here again.
pub fn pause_marginal(cores: u32, cfg: &AllocationConfig) -> u32 {
    if cores > 0 && cores < cfg.pause_below_cores {
        0
    } else {
        cores
    }
}
