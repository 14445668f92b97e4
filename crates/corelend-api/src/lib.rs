//! corelend-api — admin and load-ingest API for the corelend daemon.
//!
//! The host application reports its load here, and operators inspect and
//! steer the worker.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Environment, allocation, worker and health |
//! | POST | `/api/v1/load` | Set unit count and/or performance sample |
//! | POST | `/api/v1/load/join` | A load unit joined |
//! | POST | `/api/v1/load/leave` | A load unit left |
//! | POST | `/api/v1/worker/start` | Force-start the worker |
//! | POST | `/api/v1/worker/stop` | Shut the worker down |
//! | POST | `/api/v1/worker/unpause` | Force-unpause the worker |
//! | POST | `/api/v1/worker/cores` | Pin or release the core count |
//! | POST | `/api/v1/health/recovery` | Toggle automatic recovery |
//! | POST | `/api/v1/health/reset` | Clear recovery suppression |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use corelend_autoscale::{HostLoad, LoadHandle};
use corelend_env::EnvironmentReport;
use corelend_health::HealthMonitor;
use corelend_worker::WorkerSupervisor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: WorkerSupervisor,
    pub health: HealthMonitor,
    pub load: LoadHandle,
    pub host_load: Arc<HostLoad>,
    pub environment: Arc<EnvironmentReport>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/load", post(handlers::update_load))
        .route("/load/join", post(handlers::unit_joined))
        .route("/load/leave", post(handlers::unit_left))
        .route("/worker/start", post(handlers::start_worker))
        .route("/worker/stop", post(handlers::stop_worker))
        .route("/worker/unpause", post(handlers::unpause_worker))
        .route("/worker/cores", post(handlers::override_cores))
        .route("/health/recovery", post(handlers::toggle_recovery))
        .route("/health/reset", post(handlers::reset_recovery))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
