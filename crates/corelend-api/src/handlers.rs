//! REST API handlers.
//!
//! Load updates are forwarded to the load monitor as events; worker and
//! health actions call straight into the supervisor and health monitor.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use corelend_autoscale::{AllocationStatus, LoadEvent, LoadSource};
use corelend_core::WorkerState;
use corelend_env::EnvironmentReport;
use corelend_health::HealthReport;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn monitor_unavailable() -> axum::response::Response {
    error_response("load monitor is not running", StatusCode::SERVICE_UNAVAILABLE).into_response()
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusReport {
    pub environment: EnvironmentReport,
    pub allocation: AllocationStatus,
    pub worker: WorkerState,
    pub health: HealthReport,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(StatusReport {
        environment: state.environment.as_ref().clone(),
        allocation: state.load.status(),
        worker: state.supervisor.state(),
        health: state.health.report(),
    })
}

// ── Load ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoadUpdate {
    pub units: Option<u32>,
    pub performance: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct LoadAck {
    pub load_units: u32,
}

/// POST /api/v1/load
pub async fn update_load(
    State(state): State<ApiState>,
    Json(req): Json<LoadUpdate>,
) -> impl IntoResponse {
    if req.units.is_none() && req.performance.is_none() {
        return error_response("expected units and/or performance", StatusCode::BAD_REQUEST)
            .into_response();
    }
    if let Some(performance) = req.performance
        && !performance.is_finite()
    {
        return error_response("performance must be a finite number", StatusCode::BAD_REQUEST)
            .into_response();
    }

    if let Some(units) = req.units {
        state.host_load.set_units(units);
    }
    if req.performance.is_some() {
        state.host_load.set_performance(req.performance);
    }
    if !state.load.send(LoadEvent::Reevaluate).await {
        return monitor_unavailable();
    }
    ApiResponse::ok(LoadAck {
        load_units: state.host_load.load_units(),
    })
    .into_response()
}

/// POST /api/v1/load/join
pub async fn unit_joined(State(state): State<ApiState>) -> impl IntoResponse {
    let load_units = state.host_load.join();
    if !state.load.send(LoadEvent::UnitJoined).await {
        return monitor_unavailable();
    }
    ApiResponse::ok(LoadAck { load_units }).into_response()
}

/// POST /api/v1/load/leave
pub async fn unit_left(State(state): State<ApiState>) -> impl IntoResponse {
    let load_units = state.host_load.leave();
    if !state.load.send(LoadEvent::UnitLeft).await {
        return monitor_unavailable();
    }
    ApiResponse::ok(LoadAck { load_units }).into_response()
}

// ── Worker ─────────────────────────────────────────────────────

/// POST /api/v1/worker/start
pub async fn start_worker(State(state): State<ApiState>) -> impl IntoResponse {
    info!("worker start requested via API");
    if !state.supervisor.force_start().await {
        return error_response("worker failed to start", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    }
    ApiResponse::ok(state.supervisor.state()).into_response()
}

/// POST /api/v1/worker/stop
pub async fn stop_worker(State(state): State<ApiState>) -> impl IntoResponse {
    info!("worker stop requested via API");
    state.supervisor.shutdown().await;
    ApiResponse::ok(state.supervisor.state())
}

/// POST /api/v1/worker/unpause
pub async fn unpause_worker(State(state): State<ApiState>) -> impl IntoResponse {
    if !state.supervisor.force_unpause().await {
        return error_response("worker could not be unpaused", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    }
    ApiResponse::ok(state.supervisor.state()).into_response()
}

/// Core override body. `null` returns to automatic allocation.
#[derive(Debug, Deserialize)]
pub struct CoreOverride {
    pub cores: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct OverrideAck {
    pub override_cores: Option<u32>,
}

/// POST /api/v1/worker/cores
pub async fn override_cores(
    State(state): State<ApiState>,
    Json(req): Json<CoreOverride>,
) -> impl IntoResponse {
    let total = state.load.status().allocation.total_cores;
    if let Some(cores) = req.cores
        && cores >= total
    {
        warn!(cores, total, "core override rejected");
        return error_response(
            &format!("override {cores} must be below total cores {total}"),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    if !state.load.send(LoadEvent::Override(req.cores)).await {
        return monitor_unavailable();
    }
    ApiResponse::ok(OverrideAck {
        override_cores: req.cores,
    })
    .into_response()
}

// ── Health ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecoveryToggle {
    pub enabled: bool,
}

/// POST /api/v1/health/recovery
pub async fn toggle_recovery(
    State(state): State<ApiState>,
    Json(req): Json<RecoveryToggle>,
) -> impl IntoResponse {
    state.health.set_auto_recovery(req.enabled);
    ApiResponse::ok(state.health.report())
}

/// POST /api/v1/health/reset
pub async fn reset_recovery(State(state): State<ApiState>) -> impl IntoResponse {
    state.health.reset_recovery();
    ApiResponse::ok(state.health.report())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use corelend_autoscale::{HostLoad, LoadMonitor};
    use corelend_core::{
        AllocationConfig, EnvironmentKind, HealthConfig, LoadConfig, LogNotifier,
        ResourceLimits, WorkerConfig,
    };
    use corelend_health::HealthMonitor;
    use corelend_worker::WorkerSupervisor;

    struct Fixture {
        state: ApiState,
        monitor: Option<LoadMonitor>,
        _dir: tempfile::TempDir,
    }

    fn fixture(binary: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let worker = WorkerConfig {
            binary: binary.into(),
            args: vec!["-c".to_string(), "exec sleep 300".to_string()],
            work_dir: dir.path().to_path_buf(),
            control_port: None,
            shutdown_grace: "0s".to_string(),
            ..WorkerConfig::default()
        };
        let supervisor = WorkerSupervisor::spawn(worker, false);
        let limits = ResourceLimits {
            max_cores: 8,
            recommended_cores: 6,
            max_memory_mb: 16_384,
            strict: false,
        };
        let allocation = AllocationConfig {
            total_cores: 8,
            max_cores_for_worker: 6,
            ..AllocationConfig::default()
        };
        let host_load = Arc::new(HostLoad::default());
        let monitor = LoadMonitor::new(
            LoadConfig::default(),
            allocation,
            limits,
            host_load.clone(),
            supervisor.subscribe(),
        );
        let health = HealthMonitor::new(
            HealthConfig::default(),
            Arc::new(supervisor.clone()),
            Arc::new(LogNotifier),
        );
        let environment = EnvironmentReport {
            kind: EnvironmentKind::DedicatedOrVps,
            metadata: BTreeMap::new(),
            limits,
            host_cores: 8,
            host_memory_mb: 16_384,
        };

        Fixture {
            state: ApiState {
                supervisor,
                health,
                load: monitor.handle(),
                host_load,
                environment: Arc::new(environment),
            },
            monitor: Some(monitor),
            _dir: dir,
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_every_component() {
        let fx = fixture("sh");
        let resp = status(State(fx.state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["environment"]["kind"], "dedicated_or_vps");
        assert_eq!(body["data"]["allocation"]["target_cores"], 0);
        assert_eq!(body["data"]["worker"]["phase"], "stopped");
        assert_eq!(body["data"]["health"]["status"], "healthy");
    }

    #[tokio::test]
    async fn load_update_needs_a_field() {
        let fx = fixture("sh");
        let req = LoadUpdate {
            units: None,
            performance: None,
        };
        let resp = update_load(State(fx.state.clone()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn load_update_sets_gauge() {
        let fx = fixture("sh");
        let req = LoadUpdate {
            units: Some(7),
            performance: Some(19.5),
        };
        let resp = update_load(State(fx.state.clone()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["load_units"], 7);
        assert_eq!(fx.state.host_load.load_units(), 7);
    }

    #[tokio::test]
    async fn join_and_leave_track_units() {
        let fx = fixture("sh");
        let resp = unit_joined(State(fx.state.clone())).await.into_response();
        assert_eq!(body_json(resp).await["data"]["load_units"], 1);
        unit_joined(State(fx.state.clone())).await;

        let resp = unit_left(State(fx.state.clone())).await.into_response();
        assert_eq!(body_json(resp).await["data"]["load_units"], 1);
        assert_eq!(fx.state.host_load.load_units(), 1);
    }

    #[tokio::test]
    async fn events_without_monitor_are_unavailable() {
        let mut fx = fixture("sh");
        drop(fx.monitor.take());
        let resp = unit_joined(State(fx.state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn override_must_leave_host_a_core() {
        let fx = fixture("sh");
        let resp = override_cores(State(fx.state.clone()), Json(CoreOverride { cores: Some(8) }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = override_cores(State(fx.state.clone()), Json(CoreOverride { cores: Some(4) }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = override_cores(State(fx.state.clone()), Json(CoreOverride { cores: None }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let fx = fixture("/nonexistent/worker-binary");
        let resp = start_worker(State(fx.state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["success"], false);
    }

    #[tokio::test]
    async fn start_then_stop_worker() {
        let fx = fixture("sh");
        let resp = start_worker(State(fx.state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(fx.state.supervisor.is_running());

        let resp = stop_worker(State(fx.state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["phase"], "stopped");
        assert!(fx.state.supervisor.is_shutting_down());
    }

    #[tokio::test]
    async fn recovery_toggle_and_reset() {
        let fx = fixture("sh");
        let resp = toggle_recovery(State(fx.state.clone()), Json(RecoveryToggle { enabled: false }))
            .await
            .into_response();
        assert_eq!(body_json(resp).await["data"]["auto_recovery"], false);
        assert!(!fx.state.health.auto_recovery());

        let resp = reset_recovery(State(fx.state.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["recovery"]["attempts"], 0);
        assert_eq!(body["data"]["recovery"]["suppressed"], false);
    }
}
