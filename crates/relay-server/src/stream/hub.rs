//! Per-endpoint stream hub.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use axum::response::Response;
use metrics::counter;
use relay_core::{ClientId, Message};
use tracing::{debug, info};

use super::connection::{self, Connection};
use super::fanout::Fanout;
use super::handler::{EventHandler, HandlerFactory, NoopHandler};
use super::registry::SessionRegistry;
use super::session::Session;
use super::callback;
use crate::config::StreamSettings;
use crate::errors::StreamError;
use crate::metrics::BROADCASTS_TOTAL;
use crate::request::StreamRequest;
use crate::shutdown::ShutdownCoordinator;

/// Owns the fan-out, handler factory, and session registry of one endpoint.
///
/// Cheap to clone; clones share state. Handlers receive the hub in
/// `on_initialize` and may keep a clone to broadcast later.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    path: String,
    settings: StreamSettings,
    fanout: Fanout,
    factory: Option<HandlerFactory>,
    registry: SessionRegistry,
    shutdown: Arc<ShutdownCoordinator>,
}

impl StreamHub {
    /// Create a hub for `path`.
    ///
    /// Settings must already be validated (non-zero capacities).
    pub fn new(
        path: impl Into<String>,
        settings: StreamSettings,
        factory: Option<HandlerFactory>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let fanout = Fanout::new(settings.fanout_capacity);
        Self {
            inner: Arc::new(HubInner {
                path: path.into(),
                settings,
                fanout,
                factory,
                registry: SessionRegistry::new(),
                shutdown,
            }),
        }
    }

    /// Endpoint path this hub serves.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Stream settings in effect.
    pub fn settings(&self) -> &StreamSettings {
        &self.inner.settings
    }

    /// Publish `message` to every connection attached to this endpoint.
    ///
    /// Never waits on slow connections and has no delivery acknowledgement.
    pub fn broadcast(&self, message: Message) {
        let event = message.event().to_owned();
        let recipients = self.inner.fanout.publish(message);
        counter!(BROADCASTS_TOTAL, "endpoint" => self.inner.path.clone()).increment(1);
        debug!(endpoint = %self.inner.path, event, recipients, "broadcast");
    }

    /// Look up a connected session.
    pub fn find(&self, client_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.get(client_id)
    }

    /// Copy of all connected sessions.
    pub fn snapshot(&self) -> HashMap<ClientId, Arc<Session>> {
        self.inner.registry.snapshot()
    }

    /// Visit connected sessions until `visit` breaks.
    ///
    /// Runs under the registry read lock: `visit` may send direct messages or
    /// close sessions but must not wait on connection setup or teardown.
    pub fn for_each<F>(&self, visit: F)
    where
        F: FnMut(&Arc<Session>) -> ControlFlow<()>,
    {
        self.inner.registry.for_each(visit);
    }

    /// Connected session count.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether no session is connected.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Accept a stream request and start its connection worker.
    pub async fn accept(&self, request: StreamRequest) -> Result<Connection, StreamError> {
        connection::accept(self, request).await
    }

    /// Route a callback request to the session it names.
    pub async fn handle_callback(&self, request: StreamRequest) -> Result<Response, StreamError> {
        callback::dispatch(self, &request).await
    }

    /// Close every connected session; their workers run the usual teardown.
    ///
    /// Returns how many sessions this call closed.
    pub fn close_all(&self) -> usize {
        let closed = self
            .snapshot()
            .values()
            .filter(|session| session.close())
            .count();
        info!(endpoint = %self.inner.path, closed, "closed all sessions");
        closed
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub(crate) fn fanout(&self) -> &Fanout {
        &self.inner.fanout
    }

    pub(crate) fn shutdown(&self) -> &ShutdownCoordinator {
        &self.inner.shutdown
    }

    pub(crate) fn new_handler(&self) -> Arc<dyn EventHandler> {
        match &self.inner.factory {
            Some(factory) => factory(),
            None => Arc::new(NoopHandler),
        }
    }
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("path", &self.inner.path)
            .field("sessions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}
