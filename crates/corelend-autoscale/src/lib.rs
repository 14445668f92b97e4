//! corelend-autoscale — core allocation driven by host load.
//!
//! `allocator::compute` is the pure policy; `LoadMonitor` decides when to
//! run it and pushes changed targets to the worker.
//!
//! # Allocation Algorithm
//!
//! ```text
//! needed_for_host = max(reserved + units * cores_per_unit, min_cores_for_host)
//! target          = clamp(floor(total - needed_for_host), 0, max_cores_for_worker)
//! target          = min(target, total - 1)
//!
//! if strict host:               target = min(target, limits.max_cores)
//! if 0 < target < pause_below:  target = 0        // pause instead of trickling
//! if performance < minimum:     target -= backpressure_step
//! ```
//!
//! Join/leave bursts inside `grace_period` of the previous change are
//! debounced: the monitor waits for the load to settle and re-evaluates
//! once the window has passed.

pub mod allocator;
pub mod monitor;

pub use allocator::compute;
pub use monitor::{
    AllocationStatus, ApplyCallback, BoxFuture, Evaluation, HostLoad, LoadEvent, LoadHandle,
    LoadMonitor, LoadSource, NominalPerformance, PerformanceSignal,
};
