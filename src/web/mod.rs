use axum::{
    Json, Router,
    extract::State,
    http::Method,
    middleware as axum_middleware,
    routing::get,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::controller::SessionPool;
use crate::db::services::{FleetStore, JobTracker};
use crate::server::config::ServerConfig;
use crate::server::fleet_manager::ControllerHealth;
use crate::server::{ActiveJobs, FleetManager, WorkloadDispatcher};
use crate::web::{middleware::owner, routes::*};

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub fleet_store: FleetStore,
    pub job_tracker: JobTracker,
    pub fleet_manager: Arc<FleetManager>,
    pub dispatcher: WorkloadDispatcher,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wires the services around one database connection and one controller
    /// session pool.
    pub fn new(db: Arc<DatabaseConnection>, pool: SessionPool, config: Arc<ServerConfig>) -> Self {
        let fleet_store = FleetStore::new(db.clone());
        let job_tracker = JobTracker::new(db, config.dispatch.late_finding_grace_secs);
        let active_jobs = Arc::new(ActiveJobs::new());

        let fleet_manager = Arc::new(FleetManager::new(
            fleet_store.clone(),
            job_tracker.clone(),
            pool.clone(),
            active_jobs.clone(),
            config.fleet.clone(),
            config.controller.command_timeout(),
            config.controller.provision_timeout(),
        ));
        let dispatcher = WorkloadDispatcher::new(
            fleet_store.clone(),
            job_tracker.clone(),
            pool,
            config.dispatch.clone(),
            config.controller.command_timeout(),
            active_jobs,
            fleet_manager.locks(),
        );

        Self {
            fleet_store,
            job_tracker,
            fleet_manager,
            dispatcher,
            config,
        }
    }
}

async fn health_check_handler() -> &'static str {
    "OK"
}

async fn controller_health_handler(State(app_state): State<Arc<AppState>>) -> Json<ControllerHealth> {
    Json(app_state.fleet_manager.controller_health().await)
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/api/controller/health", get(controller_health_handler))
        .nest(
            "/api/fleets",
            fleet_routes::fleet_routes().route_layer(axum_middleware::from_fn(owner::owner)),
        )
        .nest(
            "/api/jobs",
            job_routes::job_routes().route_layer(axum_middleware::from_fn(owner::owner)),
        )
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
