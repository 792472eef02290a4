use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::error::GatewayResult;
use crate::services::client_registry::ClientConfig;
use crate::types::{Client, ClientConfigQuery, ClientResponse, ListClientsResponse, MessageResponse};

/// GET /client - List clients ordered by creation time
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
) -> GatewayResult<Json<ListClientsResponse>> {
    let clients = state.clients.list().await?;
    Ok(Json(ListClientsResponse { clients }))
}

/// POST /client - Register a client and allocate its addresses
pub async fn register_client(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<Client>,
) -> GatewayResult<(StatusCode, Json<ClientResponse>)> {
    info!("Registering client: name={}", spec.name);

    let client = state.clients.register(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(ClientResponse {
            client,
            server: Some(state.clients.server().info()),
        }),
    ))
}

/// GET /client/:id
pub async fn read_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<ClientResponse>> {
    let client = state.clients.read(&id).await?;
    Ok(Json(ClientResponse {
        client,
        server: Some(state.clients.server().info()),
    }))
}

/// PATCH /client/:id - Update a client; keys are never changed
pub async fn update_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(spec): Json<Client>,
) -> GatewayResult<Json<ClientResponse>> {
    let client = state.clients.update(&id, spec).await?;
    Ok(Json(ClientResponse {
        client,
        server: None,
    }))
}

/// DELETE /client/:id
pub async fn delete_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<MessageResponse>> {
    state.clients.delete(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("client {} deleted", id),
    }))
}

/// GET /client/:id/config - WireGuard config as a download, or `?qrcode=true` for an SVG
pub async fn client_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ClientConfigQuery>,
) -> GatewayResult<Response> {
    let response = match state.clients.read_config(&id, query.qrcode).await? {
        ClientConfig::Text(text) => (
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}.conf\"", id),
                ),
            ],
            text,
        )
            .into_response(),
        ClientConfig::QrSvg(svg) => {
            ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response()
        }
    };
    Ok(response)
}
