//! Connection-scoped event handler hooks.
//!
//! Each accepted connection gets its own handler instance from the
//! endpoint's [`HandlerFactory`]. Hooks run in this order:
//!
//! 1. [`on_initialize`](EventHandler::on_initialize), after the session is
//!    registered and before anything is written
//! 2. [`on_connect`](EventHandler::on_connect), after the `on_connect`
//!    handshake message is queued
//! 3. [`on_message`](EventHandler::on_message), for every broadcast, direct,
//!    and keepalive message about to be written
//! 4. [`on_callback`](EventHandler::on_callback), for each callback request
//!    addressed to this connection's client id
//! 5. [`on_disconnect`](EventHandler::on_disconnect), exactly once after the
//!    session is removed and closed
//!
//! A handler that keeps the `Arc<Session>` it receives in `on_initialize`
//! forms a cycle (session → handler → session) that only teardown breaks.
//! Prefer keeping [`Session::client_id`] and looking the session up through
//! the hub, or hold a `Weak<Session>`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::Message;

use super::hub::StreamHub;
use super::session::Session;
use crate::errors::HandlerError;
use crate::request::StreamRequest;

/// Per-connection behaviour plugged into a stream endpoint.
///
/// Every hook has a permissive default, so implementors override only what
/// they need.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once the session exists and is registered.
    ///
    /// An error refuses the connection before any frame is written; the
    /// session is unregistered and `on_disconnect` is not called.
    async fn on_initialize(
        &self,
        _request: &StreamRequest,
        _hub: &StreamHub,
        _session: &Arc<Session>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called after the handshake message is queued.
    ///
    /// An error refuses the connection with a full teardown, including
    /// `on_disconnect`.
    async fn on_connect(&self, _request: &StreamRequest) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Filter for outbound messages; `false` suppresses `message` for this
    /// connection only.
    fn on_message(&self, _request: &StreamRequest, _message: &Message) -> bool {
        true
    }

    /// Handle a callback request addressed to this connection.
    ///
    /// The returned response goes to the callback caller, not the stream.
    async fn on_callback(&self, _request: &StreamRequest) -> Response {
        StatusCode::OK.into_response()
    }

    /// Called exactly once when the connection ends, for any reason.
    async fn on_disconnect(&self, _request: &StreamRequest) {}
}

/// Builds a fresh handler for each accepted connection.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn EventHandler> + Send + Sync>;

/// Wrap a closure as a [`HandlerFactory`].
pub fn handler_factory<F, H>(make: F) -> HandlerFactory
where
    F: Fn() -> H + Send + Sync + 'static,
    H: EventHandler + 'static,
{
    Arc::new(move || Arc::new(make()) as Arc<dyn EventHandler>)
}

/// Handler used when an endpoint is registered without a factory.
///
/// Accepts every connection, passes every message, and answers callbacks
/// with an empty `200 OK`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {}
