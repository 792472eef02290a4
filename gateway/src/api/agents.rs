use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;

use super::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::services::agent_ledger::AgentUpload;
use crate::types::{
    AgentResponse, CreateAgentResponse, ListAgentsResponse, ManageAgentQuery, MessageResponse,
};

/// GET /agents
pub async fn list_agents(State(state): State<Arc<AppState>>) -> GatewayResult<Json<ListAgentsResponse>> {
    let agents = state.agents.list().await?;
    Ok(Json(ListAgentsResponse { agents }))
}

/// GET /agents/:id
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<AgentResponse>> {
    let agent = state.agents.get(&id).await?;
    Ok(Json(AgentResponse { agent }))
}

/// POST /agents - Multipart upload of a character file plus presentation fields
pub async fn add_agent(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> GatewayResult<(StatusCode, Json<CreateAgentResponse>)> {
    let upload = read_upload(multipart).await?;
    info!("Received agent upload: file={}", upload.file_name);

    let created = state.agents.add_agent(upload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn read_upload(mut multipart: Multipart) -> GatewayResult<AgentUpload> {
    let mut upload = AgentUpload::default();
    let mut have_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::Upload(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "character_file" => {
                upload.file_name = field.file_name().unwrap_or_default().to_string();
                upload.contents = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Upload(e.to_string()))?
                    .to_vec();
                have_file = true;
            }
            "avatar_img" | "cover_img" | "voice_model" | "organization" | "docker_url"
            | "domain" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::Upload(e.to_string()))?;
                match name.as_str() {
                    "avatar_img" => upload.avatar_img = value,
                    "cover_img" => upload.cover_img = value,
                    "voice_model" => upload.voice_model = value,
                    "organization" => upload.organization = value,
                    "docker_url" => upload.docker_url = Some(value),
                    _ => upload.domain = Some(value),
                }
            }
            _ => {}
        }
    }

    if !have_file {
        return Err(GatewayError::Upload(
            "Failed to retrieve character file".to_string(),
        ));
    }
    Ok(upload)
}

/// DELETE /agents/:id - Remove container, route and ledger entry
pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<MessageResponse>> {
    state.agents.delete_agent(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("Agent {} deleted successfully", id),
    }))
}

/// PATCH /agents/manage/:id?action=pause|resume
pub async fn manage_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ManageAgentQuery>,
) -> GatewayResult<Json<AgentResponse>> {
    let agent = state.agents.manage_agent(&id, &query.action).await?;
    Ok(Json(AgentResponse { agent }))
}
