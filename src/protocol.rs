//! Wire protocol for dashboard client/server communication.
//!
//! Every message in either direction is a JSON envelope:
//! `{ "type": string, "data": optional value, "timestamp": optional RFC3339 }`.
//!
//! The `type` tag is mandatory; everything else is message-specific. The
//! server never rejects an envelope for carrying an unknown type — routing
//! surfaces an "unsupported" outcome instead (see [`crate::router`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{ConnectionId, Session};

/// A single wire message in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag. Always present.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Send time, RFC3339. Optional on the wire; the server stamps
    /// everything it emits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Build an envelope with no payload, stamped with the current time.
    pub fn event(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Build an envelope carrying a payload, stamped with the current time.
    pub fn with_data(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            timestamp: Some(Utc::now()),
        }
    }

    /// Server → client error message, directed at a single peer.
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_data(
            "error",
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Server → client session bootstrap message, sent once per connection
    /// after the handshake completes.
    pub fn session_created(session: &Session) -> Self {
        Self::with_data(
            "session_created",
            serde_json::json!({
                "session_id": session.token,
                "is_reconnection": session.reconnection,
            }),
        )
    }

    /// Server → client broadcast relay, tagged with the originating
    /// connection so receivers can attribute it.
    pub fn broadcast_from(from: ConnectionId, data: Option<serde_json::Value>) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert("from".into(), serde_json::json!(from));
        if let Some(data) = data {
            payload.insert("data".into(), data);
        }
        Self::with_data("broadcast", serde_json::Value::Object(payload))
    }

    /// Parse an inbound envelope from raw text.
    ///
    /// Fails when the text is not JSON or the `type` tag is missing; the
    /// caller turns that into a connection-local `error` message, never a
    /// dropped connection.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        // Envelope contains only JSON-representable fields; serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
