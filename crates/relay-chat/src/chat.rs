//! Chat room handler: every connected client is a participant.
//!
//! Participants are named by their remote address. Joining and leaving are
//! announced to the room, and `chat_message` callbacks are relayed to
//! everyone, the sender included.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::Message;
use relay_server::{EventHandler, HandlerError, Session, StreamError, StreamHub, StreamRequest};
use serde::Deserialize;
use tracing::debug;

/// Event name of a chat line, inbound and outbound.
pub const CHAT_MESSAGE_EVENT: &str = "chat_message";
/// Broadcast when a participant connects.
pub const USER_JOIN_EVENT: &str = "user_join";
/// Broadcast when a participant disconnects.
pub const USER_LEAVE_EVENT: &str = "user_leave";

/// Callback body sent by chat clients.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Incoming {
    event: String,
    message: String,
}

/// One participant's handler.
#[derive(Debug, Default)]
pub struct ChatRoomHandler {
    hub: OnceLock<StreamHub>,
    username: OnceLock<String>,
}

impl ChatRoomHandler {
    /// Create an uninitialised handler; the hub and name are set on initialize.
    pub fn new() -> Self {
        Self::default()
    }

    fn username(&self) -> &str {
        self.username.get().map_or("", String::as_str)
    }

    fn announce(&self, message: Message) {
        if let Some(hub) = self.hub.get() {
            hub.broadcast(message);
        }
    }
}

/// Room-wide message attributed to `user`.
fn room_message(event: &str, user: &str, text: impl Into<String>) -> Message {
    Message::with_event(event)
        .with("user", user)
        .with("message", text.into())
}

#[async_trait]
impl EventHandler for ChatRoomHandler {
    async fn on_initialize(
        &self,
        request: &StreamRequest,
        hub: &StreamHub,
        _session: &Arc<Session>,
    ) -> Result<(), HandlerError> {
        let _ = self.hub.set(hub.clone());
        let _ = self.username.set(request.remote_addr());
        Ok(())
    }

    async fn on_connect(&self, _request: &StreamRequest) -> Result<(), HandlerError> {
        self.announce(room_message(USER_JOIN_EVENT, self.username(), "has joined the chat."));
        Ok(())
    }

    async fn on_callback(&self, request: &StreamRequest) -> Response {
        let Ok(incoming) = request.json_body::<Incoming>() else {
            return StreamError::InvalidRequest("Invalid JSON".into()).into_response();
        };
        if incoming.event != CHAT_MESSAGE_EVENT {
            // Keepalive replies and other client chatter.
            debug!(user = self.username(), event = %incoming.event, "ignoring callback");
            return StatusCode::OK.into_response();
        }
        if incoming.message.is_empty() {
            return StreamError::InvalidRequest("Empty message".into()).into_response();
        }

        self.announce(room_message(CHAT_MESSAGE_EVENT, self.username(), incoming.message));
        StatusCode::OK.into_response()
    }

    async fn on_disconnect(&self, _request: &StreamRequest) {
        self.announce(room_message(USER_LEAVE_EVENT, self.username(), "has left the chat."));
    }
}
