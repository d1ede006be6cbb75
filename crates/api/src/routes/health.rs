//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::realtime::HubStats;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    /// `connected`, `disconnected` or `disabled`
    pub bridge: String,
    pub realtime: HubStats,
}

/// Health check endpoint
///
/// A disconnected bridge is reported but does not make the service unhealthy;
/// local delivery keeps working without it.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "healthy".to_string(),
        Err(e) => {
            tracing::warn!(error = ?e, "Health check: database unreachable");
            "unhealthy".to_string()
        }
    };

    let overall_status = if db_status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall_status,
        Json(HealthResponse {
            status: if overall_status == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status,
            bridge: state.bridge_status().to_string(),
            realtime: state.hub.stats(),
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe; only the database gates traffic
pub async fn readiness(State(state): State<AppState>) -> ApiResult<StatusCode> {
    if state.hub.is_shutting_down() {
        return Err(ApiError::ServiceUnavailable);
    }

    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::warn!(error = ?e, "Readiness check: database unreachable");
            ApiError::ServiceUnavailable
        })?;
    Ok(StatusCode::OK)
}
