//! Wire envelope pushed to realtime clients
//!
//! Every frame a client receives is a JSON object
//! `{"type": string, "data": <json>, "timestamp": RFC3339}`.

use courier_shared::{Identity, Notification};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

/// Envelope type carrying a serialized notification record
pub const NOTIFICATION: &str = "notification";
/// Envelope type acknowledging a freshly registered connection
pub const CONNECTED: &str = "connected";
/// Envelope type for platform-wide operational alerts
pub const ALERT: &str = "alert";

/// Immutable message shared by every recipient connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl Envelope {
    /// Build an envelope stamped with the current time
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Wrap a persisted notification record
    pub fn notification(notification: &Notification) -> Result<Self, serde_json::Error> {
        Ok(Self::new(NOTIFICATION, serde_json::to_value(notification)?))
    }

    /// Acknowledgement queued ahead of anything else on a new connection
    pub fn connected(session_id: Uuid, identity: &Identity) -> Self {
        Self::new(
            CONNECTED,
            json!({
                "session_id": session_id,
                "role": identity.role,
                "entity_id": identity.entity_id,
            }),
        )
    }

    /// Operational alert for platform operators
    pub fn alert(title: &str, body: &str, extra: serde_json::Value) -> Self {
        Self::new(
            ALERT,
            json!({
                "title": title,
                "body": body,
                "extra": extra,
            }),
        )
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// Encode as the text frame written to the transport
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
