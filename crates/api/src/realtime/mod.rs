//! Real-time push delivery
//!
//! # Architecture
//!
//! - **Connection**: one authenticated duplex channel, driven by an inbound and an outbound pump
//! - **Queue**: bounded per-connection outbound buffer with an overflow policy
//! - **Hub**: per-process registry keyed by `(role, entity id)`
//! - **Bridge**: cross-process pub/sub so any instance can reach any recipient
//! - **Handler**: Axum upgrade routes
//! - **Envelope**: the JSON frame every client receives

pub mod bridge;
pub mod connection;
pub mod envelope;
pub mod handler;
pub mod hub;
pub mod queue;

pub use bridge::{Bridge, BridgeError, BridgeSettings, Broker, BrokerMessage, LoopbackBroker, RedisBroker};
pub use connection::{Connection, ConnectionSettings, ConnectionState};
pub use envelope::Envelope;
pub use handler::{platform_ws_handler, ws_handler};
pub use hub::{Hub, HubStats};
pub use queue::{EnqueueOutcome, OutboundQueue, OverflowPolicy};
