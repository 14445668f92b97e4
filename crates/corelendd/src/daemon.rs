//! Daemon mode — builds the root [`Context`] and runs every loop until
//! Ctrl-C.
//!
//! ```text
//! load config ── probe environment ── validate allocation (persist fixes)
//!        │
//!        ├── WorkerSupervisor::spawn + start
//!        ├── LoadMonitor  ── apply_fn ──▶ supervisor.set_cores
//!        ├── HealthMonitor ── Recoverable ──▶ supervisor
//!        └── API server (optional)
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;
use tracing::{error, info, warn};

use corelend_api::{ApiState, build_router};
use corelend_autoscale::{BoxFuture, HostLoad, LoadHandle, LoadMonitor};
use corelend_core::{
    AllocationConfig, ControlMode, CorelendConfig, LogNotifier, Notification, Notifier,
};
use corelend_env::{EnvironmentProbe, EnvironmentReport};
use corelend_health::HealthMonitor;
use corelend_worker::WorkerSupervisor;

/// Load the config file, or defaults when there is none.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CorelendConfig> {
    match path {
        Some(path) if path.exists() => {
            let config = CorelendConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!(path = %path.display(), "config loaded");
            Ok(config)
        }
        Some(path) => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(CorelendConfig::default())
        }
        None => Ok(CorelendConfig::default()),
    }
}

/// Owns every component of a running daemon.
pub struct Context {
    pub config: CorelendConfig,
    pub environment: Arc<EnvironmentReport>,
    /// Validated allocation the allocator runs with.
    pub allocation: AllocationConfig,
    pub supervisor: WorkerSupervisor,
    pub host_load: Arc<HostLoad>,
    pub load_monitor: LoadMonitor,
    pub load: LoadHandle,
    pub health: HealthMonitor,
}

impl Context {
    pub fn build(
        mut config: CorelendConfig,
        config_path: Option<&Path>,
        environment: EnvironmentReport,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let validated = config
            .allocation
            .validate(&environment.limits, environment.host_cores);
        if validated.needs_persist() {
            let fixes = validated
                .corrections
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            notifier.notify(Notification::warning(format!(
                "Allocation config corrected: {fixes}"
            )));
            config.allocation = validated.persisted.clone();
            if let Some(path) = config_path {
                match config.save(path) {
                    Ok(()) => info!(path = %path.display(), "corrected config saved"),
                    Err(e) => warn!(error = %e, "failed to save corrected config"),
                }
            }
        }

        let control_permitted = environment.kind.permits_control_port();
        let supervisor = WorkerSupervisor::spawn_with_notifier(
            config.worker.clone(),
            control_permitted,
            notifier.clone(),
        );
        if supervisor.mode() == ControlMode::File && config.worker.control_port.is_some() {
            notifier.notify(Notification::warning(format!(
                "Control port not permitted on {} hosts, driving the worker through its config file",
                environment.kind
            )));
        }

        let host_load = Arc::new(HostLoad::default());
        let apply = supervisor.clone();
        let load_monitor = LoadMonitor::new(
            config.load.clone(),
            validated.config.clone(),
            environment.limits,
            host_load.clone(),
            supervisor.subscribe(),
        )
        .with_performance(host_load.clone())
        .with_apply_fn(Box::new(move |cores| -> BoxFuture {
            let supervisor = apply.clone();
            Box::pin(async move { supervisor.set_cores(cores).await })
        }));
        let load = load_monitor.handle();

        let health = HealthMonitor::new(
            config.health.clone(),
            Arc::new(supervisor.clone()),
            notifier.clone(),
        );

        Self {
            config,
            environment: Arc::new(environment),
            allocation: validated.config,
            supervisor,
            host_load,
            load_monitor,
            load,
            health,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            supervisor: self.supervisor.clone(),
            health: self.health.clone(),
            load: self.load.clone(),
            host_load: self.host_load.clone(),
            environment: self.environment.clone(),
        }
    }

    /// Start the worker and every loop, then wait for Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = if self.config.api.enabled {
            let addr: SocketAddr = self
                .config
                .api
                .listen
                .parse()
                .with_context(|| format!("invalid api.listen {:?}", self.config.api.listen))?;
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding API listener on {addr}"))?;
            Some(listener)
        } else {
            None
        };
        let api_state = self.api_state();

        let Context {
            allocation,
            supervisor,
            load_monitor,
            health,
            ..
        } = self;

        info!(
            total_cores = allocation.total_cores,
            reserved_cores = allocation.reserved_cores,
            mode = ?supervisor.mode(),
            "starting worker"
        );
        if !supervisor.start().await {
            warn!("worker failed to start, will retry");
        }

        // ── Shutdown signal ────────────────────────────────────

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Background tasks ───────────────────────────────────

        let load_handle = tokio::spawn(load_monitor.run(shutdown_rx.clone()));
        let health_handle = tokio::spawn(health.run(shutdown_rx.clone()));

        let api_handle = listener.map(|listener| {
            let router = build_router(api_state);
            let mut api_shutdown = shutdown_rx.clone();
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "API server starting");
            }
            tokio::spawn(async move {
                let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = api_shutdown.changed().await;
                });
                if let Err(e) = server.await {
                    error!(error = %e, "API server error");
                }
            })
        });

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        supervisor.shutdown().await;

        let _ = load_handle.await;
        let _ = health_handle.await;
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }

        info!("corelend daemon stopped");
        Ok(())
    }
}

/// `corelendd run`.
pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!("corelend daemon starting");
    let config = load_config(Some(config_path.as_path()))?;
    let environment = EnvironmentProbe::system()
        .with_override(config.environment.override_kind)
        .report();

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    Context::build(config, Some(config_path.as_path()), environment, notifier)
        .run()
        .await
}
