//! Connection acceptance and the per-connection worker loop.
//!
//! [`accept`] registers a session, runs the handshake hooks, and spawns a
//! worker that multiplexes four sources until the connection ends:
//!
//! - cancellation (session closed, client gone, or server shutdown)
//! - the session's direct queue
//! - the endpoint's broadcast fan-out
//! - the idle keepalive timer
//!
//! Sources are polled in that order, so the queued handshake is always the
//! first frame even when `on_connect` broadcasts.
//!
//! Every outbound message passes through `on_message` before it is encoded
//! and written. Teardown removes the session from the registry, closes it,
//! then calls `on_disconnect`, exactly once per accepted session.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use metrics::{counter, gauge, histogram};
use relay_core::{ClientId, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use super::fanout::Consumer;
use super::hub::StreamHub;
use super::keepalive::Keepalive;
use super::session::Session;
use crate::errors::StreamError;
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL,
    DISCONNECTIONS_TOTAL,
};
use crate::request::{EVENT_STREAM, StreamRequest};

/// An accepted stream connection.
///
/// Converting it into a response hands the frame stream to the HTTP body;
/// dropping that body (client gone) cancels the worker.
pub struct Connection {
    client_id: ClientId,
    frames: mpsc::Receiver<Bytes>,
    guard: DropGuard,
    task: JoinHandle<()>,
}

impl Connection {
    /// Client id assigned to this connection.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Next encoded frame, or `None` once the worker has exited.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }

    /// Detach the client side and wait for teardown to finish.
    pub async fn disconnect(self) {
        let Self {
            frames, guard, task, ..
        } = self;
        drop(frames);
        drop(guard);
        let _ = task.await;
    }

    /// Wait for the worker to exit on its own while staying attached.
    pub async fn join(self) {
        let Self {
            frames: _frames,
            guard: _guard,
            task,
            ..
        } = self;
        let _ = task.await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl IntoResponse for Connection {
    fn into_response(self) -> Response {
        let Self { frames, guard, .. } = self;
        // The guard lives as long as the body stream.
        let body = futures::stream::unfold((frames, guard), |(mut frames, guard)| async move {
            let frame = frames.recv().await?;
            Some((Ok::<_, Infallible>(frame), (frames, guard)))
        });
        (
            [
                (header::CONTENT_TYPE, EVENT_STREAM),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            Body::from_stream(body),
        )
            .into_response()
    }
}

/// Register a session for `request`, run the handshake, and start its worker.
///
/// Dropping the returned future mid-handshake (the client went away while a
/// hook was pending) unregisters and closes the session. `on_disconnect` then
/// runs on a tracked task only if `on_connect` had already been entered.
#[instrument(skip_all, fields(endpoint = %hub.path()))]
pub(crate) async fn accept(hub: &StreamHub, request: StreamRequest) -> Result<Connection, StreamError> {
    let settings = hub.settings();
    let cancel = hub.shutdown().child_token();
    let consumer = hub.fanout().create_consumer(cancel.clone());
    let client_id = consumer.id().clone();
    let handler = hub.new_handler();
    let (session, direct) = Session::new(
        client_id.clone(),
        handler.clone(),
        settings.direct_queue_capacity,
        cancel.clone(),
    );
    let _ = hub.registry().insert(session.clone());
    let mut pending = PendingAccept::new(hub.clone(), session.clone());

    if let Err(error) = handler.on_initialize(&request, hub, &session).await {
        pending.disarm();
        let _ = hub.registry().remove(&client_id);
        let _ = session.close();
        warn!(%client_id, %error, "handler refused initialization");
        counter!(CONNECTIONS_REJECTED_TOTAL, "endpoint" => hub.path().to_owned(), "stage" => "initialize")
            .increment(1);
        return Err(StreamError::InitializationFailed(error));
    }

    let (frames, frame_rx) = mpsc::channel(settings.frame_buffer);
    let worker = Worker {
        hub: hub.clone(),
        session,
        request,
        consumer,
        direct,
        frames,
        keepalive: Keepalive::new(settings.keepalive_interval()),
        cancel: cancel.clone(),
    };

    // Fails only if on_initialize already closed or flooded the session.
    if let Err(error) = worker.session.send_direct(Message::on_connect(&client_id)) {
        pending.disarm();
        warn!(%client_id, %error, "could not queue handshake");
        worker.teardown().await;
        return Err(error);
    }

    pending.owe_disconnect(worker.request.clone());
    if let Err(error) = handler.on_connect(&worker.request).await {
        pending.disarm();
        warn!(%client_id, %error, "handler refused connection");
        counter!(CONNECTIONS_REJECTED_TOTAL, "endpoint" => hub.path().to_owned(), "stage" => "connect")
            .increment(1);
        worker.teardown().await;
        return Err(StreamError::ConnectFailed(error));
    }

    pending.disarm();
    info!(%client_id, remote = %worker.request.remote_addr(), "stream connected");
    counter!(CONNECTIONS_TOTAL, "endpoint" => hub.path().to_owned()).increment(1);
    gauge!(CONNECTIONS_ACTIVE, "endpoint" => hub.path().to_owned()).increment(1.0);
    let task = hub.shutdown().spawn(worker.run());

    Ok(Connection {
        client_id,
        frames: frame_rx,
        guard: cancel.drop_guard(),
        task,
    })
}

/// Rolls back a registered session if `accept` is dropped before it settles.
struct PendingAccept {
    hub: StreamHub,
    session: Arc<Session>,
    /// Set once `on_connect` has been entered.
    disconnect_request: Option<StreamRequest>,
    armed: bool,
}

impl PendingAccept {
    fn new(hub: StreamHub, session: Arc<Session>) -> Self {
        Self {
            hub,
            session,
            disconnect_request: None,
            armed: true,
        }
    }

    fn owe_disconnect(&mut self, request: StreamRequest) {
        self.disconnect_request = Some(request);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAccept {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client_id = self.session.client_id();
        let _ = self.hub.registry().remove(client_id);
        let _ = self.session.close();
        warn!(%client_id, "accept abandoned during handshake");
        counter!(CONNECTIONS_REJECTED_TOTAL, "endpoint" => self.hub.path().to_owned(), "stage" => "abandoned")
            .increment(1);

        let Some(request) = self.disconnect_request.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(%client_id, "no runtime to run on_disconnect for abandoned accept");
            return;
        }
        let session = self.session.clone();
        let _ = self.hub.shutdown().spawn(async move {
            session.handler().on_disconnect(&request).await;
            debug!(client_id = %session.client_id(), "abandoned session torn down");
        });
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    BroadcastClosed,
    DirectClosed,
    WriteFailed,
}

impl Exit {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::BroadcastClosed => "broadcast_closed",
            Self::DirectClosed => "direct_closed",
            Self::WriteFailed => "write_failed",
        }
    }
}

enum Outbound {
    Broadcast(Arc<Message>),
    Direct(Message),
    Keepalive(Message),
}

impl Outbound {
    fn message(&self) -> &Message {
        match self {
            Self::Broadcast(message) => message.as_ref(),
            Self::Direct(message) | Self::Keepalive(message) => message,
        }
    }
}

enum Delivery {
    Written,
    Skipped,
    Failed(Exit),
}

struct Worker {
    hub: StreamHub,
    session: Arc<Session>,
    request: StreamRequest,
    consumer: Consumer,
    direct: mpsc::Receiver<Message>,
    frames: mpsc::Sender<Bytes>,
    keepalive: Keepalive,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let started = Instant::now();
        let endpoint = self.hub.path().to_owned();

        let exit = self.pump().await;
        info!(client_id = %self.session.client_id(), reason = exit.as_str(), "stream disconnected");
        self.teardown().await;

        counter!(DISCONNECTIONS_TOTAL, "endpoint" => endpoint.clone()).increment(1);
        gauge!(CONNECTIONS_ACTIVE, "endpoint" => endpoint.clone()).decrement(1.0);
        histogram!(CONNECTION_DURATION_SECONDS, "endpoint" => endpoint)
            .record(started.elapsed().as_secs_f64());
    }

    async fn pump(&mut self) -> Exit {
        loop {
            let outbound = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Exit::Cancelled,
                received = self.direct.recv() => match received {
                    Some(message) => Outbound::Direct(message),
                    None => return Exit::DirectClosed,
                },
                received = self.consumer.recv() => match received {
                    Some(message) => Outbound::Broadcast(message),
                    None if self.cancel.is_cancelled() => return Exit::Cancelled,
                    None => return Exit::BroadcastClosed,
                },
                () = self.keepalive.fired() => Outbound::Keepalive(Message::ping_now()),
            };

            match self.deliver(outbound.message()).await {
                Delivery::Written | Delivery::Skipped => {}
                Delivery::Failed(exit) => return exit,
            }
            // Real writes and fired pings both start a new idle window; a
            // filtered message leaves the connection idle.
            if let Outbound::Keepalive(_) = outbound {
                self.keepalive.reset();
            }
        }
    }

    async fn deliver(&mut self, message: &Message) -> Delivery {
        if !self.session.handler().on_message(&self.request, message) {
            return Delivery::Skipped;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(client_id = %self.session.client_id(), %error, "dropping unencodable message");
                return Delivery::Skipped;
            }
        };
        let written = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Delivery::Failed(Exit::Cancelled),
            sent = self.frames.send(frame) => sent.is_ok(),
        };
        if written {
            self.keepalive.reset();
            Delivery::Written
        } else {
            Delivery::Failed(Exit::WriteFailed)
        }
    }

    /// Unregister, close, then notify the handler. Consumes the worker so it
    /// runs at most once.
    async fn teardown(self) {
        let Self {
            hub,
            session,
            request,
            consumer,
            direct,
            frames,
            ..
        } = self;
        let _ = hub.registry().remove(session.client_id());
        let _ = session.close();
        drop((consumer, direct, frames));

        session.handler().on_disconnect(&request).await;
        debug!(client_id = %session.client_id(), "session torn down");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
