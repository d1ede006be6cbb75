//! Courier Realtime API Library
//!
//! Realtime push delivery for riders, merchants and platform operators:
//! connection registry, cross-instance bridge and the notification dispatch
//! policy, served over Axum.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use dispatch::{DispatchOutcome, Dispatcher, SendParams};
pub use error::{ApiError, ApiResult};
pub use realtime::Hub;
pub use state::AppState;
