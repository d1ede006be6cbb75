//! API routes

pub mod health;
pub mod internal;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    auth::require_internal_token,
    realtime::{platform_ws_handler, ws_handler},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // WebSocket routes (auth handled in handler via query parameter)
    let websocket_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/platform", get(platform_ws_handler));

    // Service-to-service dispatch, bearer token only
    let internal_routes = Router::new()
        .route("/notifications", post(internal::send_notification))
        .route("/alerts", post(internal::send_alert))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/internal", internal_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
