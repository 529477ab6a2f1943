//! Stream message envelope and frame encoding.
//!
//! A [`Message`] is a JSON object with an optional `event` discriminator.
//! Everything else in the object is payload owned by whoever published it.
//! On the wire each message becomes one frame:
//!
//! ```text
//! data: {"event":"ping","payload":1700000000}\r\n\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::ClientId;

/// Event name of the handshake message sent to every new connection.
pub const ON_CONNECT_EVENT: &str = "on_connect";
/// Event name of the idle keepalive message.
pub const PING_EVENT: &str = "ping";

const FRAME_PREFIX: &[u8] = b"data: ";
const FRAME_SUFFIX: &[u8] = b"\r\n\r\n";

/// A JSON object delivered to stream clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Create a message carrying only an `event` discriminator.
    #[must_use]
    pub fn with_event(event: impl Into<String>) -> Self {
        Self::new().with("event", Value::String(event.into()))
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// The `event` discriminator, or `""` when absent or not a string.
    pub fn event(&self) -> &str {
        self.0.get("event").and_then(Value::as_str).unwrap_or_default()
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Borrow the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the underlying JSON object.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Encode as a single `data: <json>\r\n\r\n` frame.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let json = serde_json::to_vec(&self.0)?;
        let mut frame = BytesMut::with_capacity(FRAME_PREFIX.len() + json.len() + FRAME_SUFFIX.len());
        frame.put_slice(FRAME_PREFIX);
        frame.put_slice(&json);
        frame.put_slice(FRAME_SUFFIX);
        Ok(frame.freeze())
    }

    /// Handshake message queued to a connection right after it is accepted.
    ///
    /// `observer_id` mirrors `client_id` for clients that still read the
    /// older field name.
    #[must_use]
    pub fn on_connect(client_id: &ClientId) -> Self {
        Self::with_event(ON_CONNECT_EVENT)
            .with("client_id", client_id.as_str())
            .with("observer_id", client_id.as_str())
    }

    /// Keepalive message stamped with the given unix time in seconds.
    #[must_use]
    pub fn ping(unix_secs: i64) -> Self {
        Self::with_event(PING_EVENT).with("payload", unix_secs)
    }

    /// Keepalive message stamped with the current wall-clock time.
    #[must_use]
    pub fn ping_now() -> Self {
        Self::ping(chrono::Utc::now().timestamp())
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Message {
    type Error = Value;

    /// Succeeds only for JSON objects; any other value is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Object(message.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
