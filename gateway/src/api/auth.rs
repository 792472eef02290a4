use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use super::AppState;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{ChallengeQuery, ChallengeResponse, ChallengeStatusResponse};

/// GET /authenticate?walletAddress=..&chainName=.. - Issue a login challenge
pub async fn challenge(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChallengeQuery>,
) -> GatewayResult<Json<ChallengeResponse>> {
    let challenge_id = state
        .challenges
        .issue(&query.wallet_address, &query.chain_name)?;

    Ok(Json(ChallengeResponse {
        challenge_id,
        eula: state.auth_eula.clone(),
    }))
}

/// GET /authenticate/:challenge_id - Wallet and chain of an outstanding challenge
pub async fn challenge_status(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<String>,
) -> GatewayResult<Json<ChallengeStatusResponse>> {
    let challenge = state
        .challenges
        .lookup(&challenge_id)
        .ok_or_else(|| GatewayError::NotFound("Challenge Id not found".to_string()))?;

    Ok(Json(ChallengeStatusResponse {
        challenge_id,
        wallet_address: challenge.wallet_address,
        chain_name: challenge.chain_name,
    }))
}
