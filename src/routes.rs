use axum::{middleware, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::accounts::handlers as account_handlers;
use crate::auth::middleware::JwtSecret;
use crate::chat::{presence, roster};
use crate::groups::handlers as group_handlers;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting: 5 requests per minute per IP on credential endpoints.
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(12) // 1 token every 12 seconds = 5 per minute
            .burst_size(5)  // Allow burst of 5
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    // Credential routes with rate limiting
    let auth_routes = Router::new()
        .route(
            "/api/register",
            axum::routing::post(account_handlers::register),
        )
        .route("/api/login", axum::routing::post(account_handlers::login))
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Authenticated routes (JWT required — Claims extractor validates token)
    let authenticated_routes = Router::new()
        .route(
            "/api/groups/create",
            axum::routing::post(group_handlers::create_group),
        )
        .route(
            "/api/groups/invite",
            axum::routing::post(group_handlers::invite),
        )
        .route(
            "/api/status/user",
            axum::routing::get(presence::user_status),
        )
        .route("/api/me/chats", axum::routing::get(roster::get_chats));

    // WebSocket endpoint (auth via query param / X-Token header, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(authenticated_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
