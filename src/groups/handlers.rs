//! REST endpoints for group creation and invitation.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::middleware::Claims;
use crate::state::AppState;
use crate::store::groups;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub group_id: i64,
    pub username: String,
}

/// POST /api/groups/create
/// Create a group; the creator becomes its first member. JWT auth required.
pub async fn create_group(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "group name must not be empty".to_string(),
        ));
    }

    let db = state.db.clone();
    let creator = claims.sub.clone();
    let group_id = tokio::task::spawn_blocking(move || groups::create_group(&db, &name, &creator))
        .await
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "group creation failed".to_string()))?
        .map_err(|e| {
            tracing::warn!(creator = %claims.sub, error = %e, "Group creation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "group creation failed".to_string())
        })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "group created",
            "group_id": group_id,
        })),
    ))
}

/// POST /api/groups/invite
/// Add a user to a group. JWT auth required; any member's token is accepted
/// (no per-group permission model).
pub async fn invite(
    State(state): State<AppState>,
    _claims: Claims,
    Json(body): Json<InviteRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if body.group_id == 0 || body.username.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "group_id and username must not be empty".to_string(),
        ));
    }

    let db = state.db.clone();
    let group_id = body.group_id;
    let username = body.username.trim().to_string();
    let result =
        tokio::task::spawn_blocking(move || groups::add_member(&db, group_id, &username))
            .await
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "invite failed".to_string()))?;

    match result {
        Ok(Some(())) => Ok(StatusCode::OK),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            "user to invite does not exist".to_string(),
        )),
        Err(e) => {
            // Distinguish "already a member" (membership PK) and "no such
            // group" (FK) from real failures via SQLite extended codes.
            if let Some(sqlite_err) = e.downcast_ref::<rusqlite::Error>() {
                if let rusqlite::Error::SqliteFailure(err, _) = sqlite_err {
                    match err.extended_code {
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => {
                            return Err((
                                StatusCode::CONFLICT,
                                "user is already in the group".to_string(),
                            ));
                        }
                        rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                            return Err((
                                StatusCode::NOT_FOUND,
                                "group does not exist".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            tracing::warn!(group_id, error = %e, "Invite failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "invite failed".to_string()))
        }
    }
}
