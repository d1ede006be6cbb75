//! Courier Shared Types and Utilities
//!
//! Domain types, store collaborators and database helpers shared by the
//! Courier realtime service.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
pub use store::{NotificationStore, PgStore, RiderDirectory};
pub use types::*;
