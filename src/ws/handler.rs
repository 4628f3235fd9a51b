use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::ws::session;

/// Query parameters for WebSocket connection.
/// Auth is via query param ?token=JWT, with an X-Token header fallback for
/// clients that cannot put credentials in the URL.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. A missing or invalid token is rejected with
/// 401 before the upgrade, so unauthenticated connections never reach the
/// hub.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get("X-Token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        });

    let Some(token) = token else {
        tracing::warn!("WebSocket connection without token");
        return (StatusCode::UNAUTHORIZED, "unauthorized: missing token").into_response();
    };

    match jwt::validate_token(&state.jwt_secret, &token) {
        Ok(claims) => {
            tracing::info!(username = %claims.sub, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| session::run_connection(socket, state, claims.sub))
        }
        Err(err) => {
            tracing::warn!(error = %err, "WebSocket auth failed");
            (StatusCode::UNAUTHORIZED, "unauthorized: invalid token").into_response()
        }
    }
}
