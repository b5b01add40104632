//! Wire types shared by the producer and the WebSocket transport.
//!
//! Two shapes travel over the socket:
//!
//! - [`Frame`] wraps every text message in both directions as
//!   `{"event": "<name>", "data": <payload>}`.
//! - [`Envelope`] is the payload of the outbound broadcast event: one per
//!   input line, `{"timestamp": "<RFC 3339>", "message": "<line>"}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event name used for broadcast envelopes.
pub const EVENT_BROADCAST: &str = "hoge";

/// Inbound event carrying an authentication payload.
pub const EVENT_AUTH_REQUEST: &str = "authRequest";

/// Inbound event reserved for client commands.
pub const EVENT_CONTROL: &str = "control";

/// A timestamped line, broadcast to every connected client.
///
/// Field order is part of the wire format: `timestamp` first, then
/// `message`. The timestamp is written in UTC with nanosecond precision and
/// trailing zero digits removed, so a whole second serializes as
/// `2024-01-01T00:00:00Z`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "rfc3339_nano")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl Envelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(message: impl Into<String>) -> Self {
        Self::at(Utc::now(), message)
    }

    /// Creates an envelope with an explicit timestamp.
    pub fn at(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    /// Serializes the envelope to its compact JSON form.
    ///
    /// # Errors
    ///
    /// Only fails if serde_json does, which it does not for this shape.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A single WebSocket text message.
///
/// Outbound frames always carry a string in `data`. Inbound frames may carry
/// any JSON value; see [`Frame::data_text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    /// Creates a frame whose payload is a string.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: serde_json::Value::String(data.into()),
        }
    }

    /// Returns the payload as text.
    ///
    /// Strings are returned as-is, a missing payload is empty, and any other
    /// value is returned as its compact JSON encoding.
    pub fn data_text(&self) -> String {
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Formats a timestamp like Go's `RFC3339Nano` layout.
pub fn format_rfc3339_nano(timestamp: &DateTime<Utc>) -> String {
    let mut out = timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = timestamp.timestamp_subsec_nanos() % 1_000_000_000;
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out.push('Z');
    out
}

mod rfc3339_nano {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_rfc3339_nano(timestamp))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
