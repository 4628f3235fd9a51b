//! Online-status query over the hub's connection registry.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub username: String,
    pub online: bool,
}

/// GET /api/status/user?username=X — JWT auth required.
/// A user is online iff they have at least one live WebSocket connection.
pub async fn user_status(
    State(state): State<AppState>,
    _claims: Claims,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let username = query
        .username
        .filter(|u| !u.is_empty())
        .ok_or((
            StatusCode::BAD_REQUEST,
            "query parameter `username` must not be empty".to_string(),
        ))?;

    let online = state.hub.is_online(&username);
    Ok(Json(StatusResponse { username, online }))
}
