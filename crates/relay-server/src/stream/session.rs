//! Per-connection session state.

use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use relay_core::{ClientId, Message};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::handler::EventHandler;
use crate::errors::StreamError;
use crate::metrics::DIRECT_DROPPED_TOTAL;

/// One live stream connection as seen by handlers and the registry.
///
/// The connection worker owns the receiving ends (broadcast consumer and
/// direct queue receiver); the session only holds what other tasks need to
/// address or stop it.
pub struct Session {
    client_id: ClientId,
    handler: Arc<dyn EventHandler>,
    /// Direct queue sender; `None` once closed.
    direct: Mutex<Option<mpsc::Sender<Message>>>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session and the receiving end of its direct queue.
    ///
    /// `direct_capacity` must be non-zero.
    pub fn new(
        client_id: ClientId,
        handler: Arc<dyn EventHandler>,
        direct_capacity: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(direct_capacity);
        let session = Arc::new(Self {
            client_id,
            handler,
            direct: Mutex::new(Some(tx)),
            cancel,
        });
        (session, rx)
    }

    /// Client id of this connection.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Handler instance bound to this connection.
    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// Token cancelled when the session closes or the server shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.direct.lock().is_none()
    }

    /// Queue a message for this connection only.
    ///
    /// Never waits: a full queue yields [`StreamError::QueueFull`] and the
    /// message is dropped.
    pub fn send_direct(&self, message: Message) -> Result<(), StreamError> {
        let direct = self.direct.lock();
        let Some(tx) = direct.as_ref() else {
            return Err(StreamError::SessionClosed);
        };
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                counter!(DIRECT_DROPPED_TOTAL).increment(1);
                debug!(client_id = %self.client_id, "direct queue full, message dropped");
                Err(StreamError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(StreamError::SessionClosed),
        }
    }

    /// Close the session: cancel its token and release the direct sender.
    ///
    /// Idempotent and safe from any thread. Returns `true` only for the call
    /// that performed the transition.
    pub fn close(&self) -> bool {
        let Some(tx) = self.direct.lock().take() else {
            return false;
        };
        drop(tx);
        self.cancel.cancel();
        debug!(client_id = %self.client_id, "session closed");
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
