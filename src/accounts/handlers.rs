//! Registration and login: bcrypt-hashed passwords, JWT on success.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::auth::jwt;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// POST /api/register
/// Create a user and hand back a token right away so the client can connect
/// without a separate login round trip.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), (StatusCode, String)> {
    let username = req.username.trim().to_string();
    let password = req.password;
    if username.is_empty() || password.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "username and password must not be empty".to_string(),
        ));
    }

    let db = state.db.clone();
    let insert_username = username.clone();
    // bcrypt is deliberately slow; keep it off the async workers together
    // with the insert.
    tokio::task::spawn_blocking(move || {
        let hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("hash error: {e}")))?;

        let conn = db
            .lock()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB lock: {e}")))?;
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![insert_username, hash, Utc::now().to_rfc3339()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                (StatusCode::CONFLICT, "username already taken".to_string())
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "registration failed".to_string()),
        })?;
        Ok(())
    })
    .await
    .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "registration failed".to_string()))??;

    let token = jwt::issue_token(&state.jwt_secret, &username)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("token error: {e}")))?;

    tracing::info!(username = %username, "User registered");

    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

/// POST /api/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, (StatusCode, String)> {
    let username = req.username.trim().to_string();
    let password = req.password;
    if username.is_empty() || password.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "username and password must not be empty".to_string(),
        ));
    }

    let db = state.db.clone();
    let lookup_username = username.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB lock: {e}")))?;
        let hash: Option<String> = conn
            .query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                [&lookup_username],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "login failed".to_string()))?;

        let Some(hash) = hash else {
            return Err((StatusCode::UNAUTHORIZED, "user does not exist".to_string()));
        };

        let valid = bcrypt::verify(&password, &hash)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("verify error: {e}")))?;
        if !valid {
            return Err((StatusCode::UNAUTHORIZED, "wrong password".to_string()));
        }
        Ok(())
    })
    .await
    .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "login failed".to_string()))??;

    let token = jwt::issue_token(&state.jwt_secret, &username)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("token error: {e}")))?;

    Ok(Json(TokenResponse { token }))
}
