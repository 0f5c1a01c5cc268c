use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::entities::fleet;
use crate::db::services::{FleetDetails, FleetSpec, FleetSummary, ReconcileReport};
use crate::server::fleet_manager::FleetExecutionReport;
use crate::web::models::{ExecuteRequest, OwnerContext, ScaleRequest};
use crate::web::{AppState, error::AppError};

pub fn fleet_routes() -> Router<Arc<AppState>> {
    Router::<Arc<AppState>>::new()
        .route("/", get(list_fleets).post(deploy_fleet))
        .route("/{fleet_id}", get(get_fleet).delete(terminate_fleet))
        .route("/{fleet_id}/provision", post(provision_fleet))
        .route("/{fleet_id}/scale", post(scale_fleet))
        .route("/{fleet_id}/execute", post(execute_on_fleet))
        .route("/{fleet_id}/reconcile", post(reconcile_fleet))
}

#[axum::debug_handler]
async fn list_fleets(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<FleetSummary>>, AppError> {
    Ok(Json(app_state.fleet_store.list_fleets(owner.id).await?))
}

#[axum::debug_handler]
async fn deploy_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Json(spec): Json<FleetSpec>,
) -> Result<(StatusCode, Json<fleet::Model>), AppError> {
    let fleet = app_state.fleet_manager.deploy_fleet(owner.id, spec).await?;
    Ok((StatusCode::CREATED, Json(fleet)))
}

#[axum::debug_handler]
async fn get_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(fleet_id): Path<Uuid>,
) -> Result<Json<FleetDetails>, AppError> {
    Ok(Json(
        app_state
            .fleet_store
            .get_fleet_details(fleet_id, owner.id)
            .await?,
    ))
}

#[axum::debug_handler]
async fn terminate_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(fleet_id): Path<Uuid>,
) -> Result<Json<fleet::Model>, AppError> {
    Ok(Json(
        app_state
            .fleet_manager
            .terminate_fleet(fleet_id, owner.id)
            .await?,
    ))
}

#[axum::debug_handler]
async fn provision_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(fleet_id): Path<Uuid>,
) -> Result<Json<fleet::Model>, AppError> {
    Ok(Json(
        app_state
            .fleet_manager
            .provision_fleet(fleet_id, owner.id)
            .await?,
    ))
}

#[axum::debug_handler]
async fn scale_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(fleet_id): Path<Uuid>,
    Json(payload): Json<ScaleRequest>,
) -> Result<Json<fleet::Model>, AppError> {
    let fleet = app_state
        .fleet_manager
        .scale_fleet(fleet_id, owner.id, payload.direction, payload.count)
        .await?;
    Ok(Json(fleet))
}

#[axum::debug_handler]
async fn execute_on_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(fleet_id): Path<Uuid>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<FleetExecutionReport>, AppError> {
    let report = app_state
        .fleet_manager
        .execute_on_fleet(fleet_id, owner.id, &payload.command)
        .await?;
    Ok(Json(report))
}

#[axum::debug_handler]
async fn reconcile_fleet(
    Extension(owner): Extension<OwnerContext>,
    State(app_state): State<Arc<AppState>>,
    Path(fleet_id): Path<Uuid>,
) -> Result<Json<ReconcileReport>, AppError> {
    Ok(Json(
        app_state
            .fleet_manager
            .reconcile_fleet(fleet_id, owner.id)
            .await?,
    ))
}
