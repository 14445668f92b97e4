//! Load monitor — turns host load into worker core allocations.
//!
//! Wakes on a fixed interval and on load events. Each evaluation samples
//! the unit count and the performance signal, debounces bursts of
//! join/leave traffic, runs the allocator and hands a changed target to
//! the apply callback (the daemon wires that to the worker supervisor).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use corelend_core::{
    AllocationConfig, LoadConfig, ResourceLimits, WorkerPhase, WorkerState, epoch_secs,
};

use crate::allocator;

/// Callback that applies a core count. Returns whether it took effect.
pub type ApplyCallback = Box<dyn Fn(u32) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>;

// ── Signals ────────────────────────────────────────────────────────

/// Number of active load units on the host.
pub trait LoadSource: Send + Sync {
    fn load_units(&self) -> u32;
}

/// Optional host performance metric (tick rate, throughput, ...).
pub trait PerformanceSignal: Send + Sync {
    fn performance(&self) -> Option<f64>;
}

/// Fallback signal for hosts without a performance metric.
#[derive(Debug, Clone, Copy)]
pub struct NominalPerformance(pub f64);

impl PerformanceSignal for NominalPerformance {
    fn performance(&self) -> Option<f64> {
        Some(self.0)
    }
}

/// Load gauge updated by the host application.
#[derive(Debug, Default)]
pub struct HostLoad {
    units: AtomicU32,
    performance: Mutex<Option<f64>>,
}

impl HostLoad {
    pub fn set_units(&self, units: u32) {
        self.units.store(units, Ordering::SeqCst);
    }

    /// Record a unit joining; returns the new count.
    pub fn join(&self) -> u32 {
        self.units.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Record a unit leaving; returns the new count.
    pub fn leave(&self) -> u32 {
        let previous = self
            .units
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    pub fn set_performance(&self, sample: Option<f64>) {
        if let Ok(mut slot) = self.performance.lock() {
            *slot = sample;
        }
    }
}

impl LoadSource for HostLoad {
    fn load_units(&self) -> u32 {
        self.units.load(Ordering::SeqCst)
    }
}

impl PerformanceSignal for HostLoad {
    fn performance(&self) -> Option<f64> {
        self.performance.lock().ok().and_then(|slot| *slot)
    }
}

// ── Events and status ──────────────────────────────────────────────

/// Inputs that wake the monitor outside its interval.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    UnitJoined,
    UnitLeft,
    Reevaluate,
    /// Pin the target (`Some`) or return to automatic allocation (`None`).
    Override(Option<u32>),
    Reconfigure(Box<AllocationConfig>),
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Load is still moving; evaluated again at `until`.
    Deferred { until: Instant },
    Unchanged { target: u32 },
    Applied { from: u32, to: u32, ok: bool },
}

/// Latest allocation decision, published for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationStatus {
    pub load_units: u32,
    pub performance: f64,
    pub target_cores: u32,
    pub override_cores: Option<u32>,
    pub backpressure: bool,
    pub allocation: AllocationConfig,
    pub limits: ResourceLimits,
    /// Unix timestamp (seconds) of the last completed evaluation.
    pub evaluated_at: u64,
}

/// Cheap handle for feeding events and reading the latest decision.
#[derive(Clone)]
pub struct LoadHandle {
    events: mpsc::Sender<LoadEvent>,
    status: watch::Receiver<AllocationStatus>,
}

impl LoadHandle {
    pub async fn send(&self, event: LoadEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn status(&self) -> AllocationStatus {
        self.status.borrow().clone()
    }
}

// ── Monitor ────────────────────────────────────────────────────────

pub struct LoadMonitor {
    config: LoadConfig,
    allocation: AllocationConfig,
    limits: ResourceLimits,
    source: Arc<dyn LoadSource>,
    performance: Arc<dyn PerformanceSignal>,
    worker: watch::Receiver<WorkerState>,
    apply_fn: Option<ApplyCallback>,
    events_tx: mpsc::Sender<LoadEvent>,
    events: mpsc::Receiver<LoadEvent>,
    status: watch::Sender<AllocationStatus>,
    override_cores: Option<u32>,
    /// Unit count at the last completed evaluation.
    stable_units: Option<u32>,
    last_change: Option<Instant>,
    deferred: Option<Instant>,
}

impl LoadMonitor {
    pub fn new(
        config: LoadConfig,
        allocation: AllocationConfig,
        limits: ResourceLimits,
        source: Arc<dyn LoadSource>,
        worker: watch::Receiver<WorkerState>,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(64);
        let nominal = config.nominal_performance;
        let (status, _) = watch::channel(AllocationStatus {
            load_units: 0,
            performance: nominal,
            target_cores: 0,
            override_cores: None,
            backpressure: false,
            allocation: allocation.clone(),
            limits,
            evaluated_at: 0,
        });

        Self {
            config,
            allocation,
            limits,
            source,
            performance: Arc::new(NominalPerformance(nominal)),
            worker,
            apply_fn: None,
            events_tx,
            events,
            status,
            override_cores: None,
            stable_units: None,
            last_change: None,
            deferred: None,
        }
    }

    /// Use a host performance metric instead of the nominal value.
    pub fn with_performance(mut self, signal: Arc<dyn PerformanceSignal>) -> Self {
        self.performance = signal;
        self
    }

    /// Set the callback used to apply a new core count.
    pub fn with_apply_fn(mut self, f: ApplyCallback) -> Self {
        self.apply_fn = Some(f);
        self
    }

    pub fn handle(&self) -> LoadHandle {
        LoadHandle {
            events: self.events_tx.clone(),
            status: self.status.subscribe(),
        }
    }

    /// Pending deferred evaluation, if any.
    pub fn deferred_until(&self) -> Option<Instant> {
        self.deferred
    }

    /// Apply one event.
    pub async fn handle_event(&mut self, event: LoadEvent, now: Instant) -> Evaluation {
        match event {
            LoadEvent::UnitJoined | LoadEvent::UnitLeft | LoadEvent::Reevaluate => {
                self.evaluate(now).await
            }
            LoadEvent::Override(cores) => {
                info!(override_cores = ?cores, "core override changed");
                self.override_cores = cores;
                self.evaluate_now().await
            }
            LoadEvent::Reconfigure(allocation) => {
                info!(
                    total_cores = allocation.total_cores,
                    reserved_cores = allocation.reserved_cores,
                    "allocation config replaced"
                );
                self.allocation = *allocation;
                self.evaluate_now().await
            }
        }
    }

    /// Evaluate with debouncing.
    ///
    /// A unit count that differs from the last evaluated one within
    /// `grace_period` of the previous change is not acted on yet; a
    /// re-evaluation is scheduled for `now + grace_period` instead.
    pub async fn evaluate(&mut self, now: Instant) -> Evaluation {
        let units = self.source.load_units();
        let changed = self.stable_units.is_some_and(|stable| stable != units);

        if changed {
            let grace = self.config.grace_period();
            let recent = self
                .last_change
                .is_some_and(|at| now.saturating_duration_since(at) < grace);
            self.last_change = Some(now);

            if recent {
                let until = now + grace;
                self.deferred = Some(until);
                debug!(
                    units,
                    grace_secs = grace.as_secs(),
                    "load still changing, evaluation deferred"
                );
                return Evaluation::Deferred { until };
            }
        }

        self.decide(units).await
    }

    /// Evaluate immediately, skipping the debounce window.
    pub async fn evaluate_now(&mut self) -> Evaluation {
        let units = self.source.load_units();
        self.decide(units).await
    }

    async fn decide(&mut self, units: u32) -> Evaluation {
        self.deferred = None;
        self.stable_units = Some(units);

        let performance = self
            .performance
            .performance()
            .unwrap_or(self.config.nominal_performance);

        let mut backpressure = false;
        let target = match self.override_cores {
            Some(cores) => cores.min(self.allocation.total_cores.saturating_sub(1)),
            None => {
                let computed = allocator::compute(units, &self.allocation, &self.limits);
                if computed > 0 && performance < self.config.min_performance {
                    backpressure = true;
                    let reduced = allocator::pause_marginal(
                        computed.saturating_sub(self.config.backpressure_step),
                        &self.allocation,
                    );
                    debug!(
                        performance,
                        min_performance = self.config.min_performance,
                        computed,
                        reduced,
                        "host performance low, backing off"
                    );
                    reduced
                } else {
                    computed
                }
            }
        };

        self.status.send_replace(AllocationStatus {
            load_units: units,
            performance,
            target_cores: target,
            override_cores: self.override_cores,
            backpressure,
            allocation: self.allocation.clone(),
            limits: self.limits,
            evaluated_at: epoch_secs(),
        });

        let (current, phase) = {
            let state = self.worker.borrow();
            (state.current_cores, state.phase)
        };
        if target == current {
            return Evaluation::Unchanged { target };
        }

        info!(units, from = current, to = target, "adjusting worker cores");
        let ok = match &self.apply_fn {
            Some(apply) => apply(target).await,
            None => false,
        };
        if !ok {
            if phase == WorkerPhase::Stopped {
                debug!(target, "worker stopped, allocation not applied");
            } else {
                warn!(target, "failed to apply worker cores");
            }
        }
        Evaluation::Applied {
            from: current,
            to: target,
            ok,
        }
    }

    /// Run until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.config.grace_period().as_secs(),
            "load monitor started"
        );

        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deferred = self.deferred;
            tokio::select! {
                _ = tick.tick() => {
                    self.evaluate(Instant::now()).await;
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event, Instant::now()).await;
                }
                _ = sleep_until(deferred) => {
                    self.evaluate(Instant::now()).await;
                }
                _ = shutdown.changed() => {
                    info!("load monitor shutting down");
                    break;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
