pub mod agents;
pub mod auth;
pub mod clients;
pub mod services;

use axum::{
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::services::{AgentLedger, ChallengeStore, ClientRegistry, ServiceRegistry};
use crate::types::HealthResponse;

pub struct AppState {
    pub clients: ClientRegistry,
    pub services: ServiceRegistry,
    pub agents: AgentLedger,
    pub challenges: Arc<ChallengeStore>,
    pub auth_eula: String,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        // VPN clients
        .route("/client", get(clients::list_clients).post(clients::register_client))
        .route(
            "/client/:id",
            get(clients::read_client)
                .patch(clients::update_client)
                .delete(clients::delete_client),
        )
        .route("/client/:id/config", get(clients::client_config))
        // Reverse-proxy routes
        .route("/caddy", get(services::list_services).post(services::add_service))
        .route(
            "/caddy/:name",
            get(services::get_service).delete(services::delete_service),
        )
        // Agents
        .route("/agents", get(agents::list_agents).post(agents::add_agent))
        .route(
            "/agents/:id",
            get(agents::get_agent).delete(agents::delete_agent),
        )
        .route("/agents/manage/:id", patch(agents::manage_agent))
        // Login challenges
        .route("/authenticate", get(auth::challenge))
        .route("/authenticate/:challenge_id", get(auth::challenge_status));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1.0", v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET /health - Health check endpoint
async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}
