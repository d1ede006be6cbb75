//! Authentication for realtime connections
//!
//! Resolves the verified [`Identity`] of a client before its transport is
//! upgraded. A failure here rejects the HTTP request, so a connection that
//! fails authorization is never registered with the hub.

pub mod internal;
pub mod jwt;

pub use internal::require_internal_token;
pub use jwt::{Claims, JwtError, JwtManager};

use courier_shared::{Identity, RiderDirectory, Role};

use crate::error::ApiError;

/// Which upgrade endpoint the client came through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEndpoint {
    /// `/ws`: riders and merchants
    Field,
    /// `/ws/platform`: platform operators
    Platform,
}

impl UpgradeEndpoint {
    pub fn admits(&self, role: Role) -> bool {
        match self {
            Self::Field => matches!(role, Role::Rider | Role::Merchant),
            Self::Platform => role == Role::Platform,
        }
    }
}

/// Validate `token` and check the resulting identity may use `endpoint`.
///
/// Riders additionally need their online flag set.
pub async fn authorize_upgrade(
    jwt: &JwtManager,
    riders: &dyn RiderDirectory,
    token: &str,
    endpoint: UpgradeEndpoint,
) -> Result<Identity, ApiError> {
    let identity = jwt.validate_token(token)?.identity();

    if !endpoint.admits(identity.role) {
        tracing::warn!(
            role = %identity.role,
            entity_id = %identity.entity_id,
            endpoint = ?endpoint,
            "Realtime upgrade rejected: role not allowed on endpoint"
        );
        return Err(ApiError::Forbidden);
    }

    if identity.role == Role::Rider && !riders.is_rider_online(identity.entity_id).await? {
        tracing::info!(
            rider_id = %identity.entity_id,
            "Realtime upgrade rejected: rider is offline"
        );
        return Err(ApiError::RiderOffline);
    }

    Ok(identity)
}
