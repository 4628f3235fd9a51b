//! Chat-partner listing: every other user plus the caller's groups.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::auth::middleware::Claims;
use crate::db::models::{Group, User};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RosterResponse {
    pub users: Vec<User>,
    pub groups: Vec<Group>,
}

/// GET /api/me/chats — JWT auth required.
pub async fn get_chats(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<RosterResponse>, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub.clone();

    let roster = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let mut stmt = conn
            .prepare(
                "SELECT id, username, created_at FROM users WHERE username != ?1 ORDER BY username",
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let users = stmt
            .query_map([&me], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = conn
            .prepare(
                "SELECT g.id, g.name, g.creator_id, g.created_at
                 FROM groups g
                 JOIN group_members gm ON g.id = gm.group_id
                 JOIN users u ON u.id = gm.user_id
                 WHERE u.username = ?1",
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let groups = stmt
            .query_map([&me], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    creator_id: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .filter_map(|r| r.ok())
            .collect();

        Ok::<_, StatusCode>(RosterResponse { users, groups })
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)??;

    Ok(Json(roster))
}
