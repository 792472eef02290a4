use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{AddServiceRequest, MessageResponse, ServiceResponse, ServicesList};

/// GET /caddy - List registered routes
pub async fn list_services(State(state): State<Arc<AppState>>) -> GatewayResult<Json<ServicesList>> {
    Ok(Json(state.services.read_services().await?))
}

/// POST /caddy - Register a route for `<name>.<domain>`
pub async fn add_service(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddServiceRequest>,
) -> GatewayResult<(StatusCode, Json<ServiceResponse>)> {
    info!(
        "Adding service: name={}, backend={}:{}",
        req.name, req.ip_address, req.port
    );

    let service = state
        .services
        .add_service(&req.name, &req.ip_address, req.port)
        .await?;
    Ok((StatusCode::CREATED, Json(ServiceResponse { service })))
}

/// GET /caddy/:name - One route with its probed liveness
pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> GatewayResult<Json<ServiceResponse>> {
    let mut service = state
        .services
        .read_service(&name)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("service {}", name)))?;

    service.status = state.services.probe_status(service.port).await.to_string();
    Ok(Json(ServiceResponse { service }))
}

/// DELETE /caddy/:name - Idempotent
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> GatewayResult<Json<MessageResponse>> {
    let removed = state.services.delete_service(&name).await?;
    let message = if removed {
        format!("service {} deleted", name)
    } else {
        format!("service {} was not registered", name)
    };
    Ok(Json(MessageResponse { message }))
}
