//! Internal dispatch API used by the order, payment and delivery services

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::dispatch::{AlertOutcome, DispatchOutcome, SendParams};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Raise one notification event.
///
/// Returns 201 when a record was created (pushed or not), 200 when the
/// recipient's preferences suppressed it.
pub async fn send_notification(
    State(state): State<AppState>,
    Json(params): Json<SendParams>,
) -> ApiResult<(StatusCode, Json<DispatchOutcome>)> {
    if params.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }

    let outcome = state.dispatcher.send(params).await?;
    let status = match outcome {
        DispatchOutcome::Suppressed => StatusCode::OK,
        _ => StatusCode::CREATED,
    };

    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct AlertRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Broadcast an operational alert to every connected platform operator
pub async fn send_alert(
    State(state): State<AppState>,
    Json(request): Json<AlertRequest>,
) -> ApiResult<Json<AlertOutcome>> {
    if request.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }

    let outcome = state
        .dispatcher
        .alert_platform(&request.title, &request.body, request.extra)
        .await;

    Ok(Json(outcome))
}
