//! WebSocket handlers for Axum
//!
//! Authenticates the upgrade request, then hands the socket to the hub.

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    response::Response,
};
use courier_shared::Identity;
use futures::stream::StreamExt;
use serde::Deserialize;

use crate::auth::{authorize_upgrade, UpgradeEndpoint};
use crate::error::ApiResult;
use crate::state::AppState;

use super::connection::{self, Connection};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: String,
}

/// `GET /ws` for riders and merchants
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> ApiResult<Response> {
    upgrade(ws, state, &params.token, UpgradeEndpoint::Field).await
}

/// `GET /ws/platform` for platform operators
pub async fn platform_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> ApiResult<Response> {
    upgrade(ws, state, &params.token, UpgradeEndpoint::Platform).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    token: &str,
    endpoint: UpgradeEndpoint,
) -> ApiResult<Response> {
    let identity =
        authorize_upgrade(&state.jwt, state.riders.as_ref(), token, endpoint).await?;

    tracing::info!(
        role = %identity.role,
        entity_id = %identity.entity_id,
        user_id = %identity.user_id,
        "Realtime connection upgrade requested"
    );

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, identity, state)))
}

/// Run one upgraded socket on the hub's task tracker
async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let settings = state.connection_settings.clone();
    let conn = Connection::new(identity, &settings);
    let (sender, receiver) = socket.split();

    let hub = state.hub.clone();
    let served = hub.spawn(connection::serve(hub.clone(), conn, sender, receiver, settings));
    if let Err(e) = served.await {
        tracing::error!(error = ?e, "Realtime connection task failed");
    }
}
