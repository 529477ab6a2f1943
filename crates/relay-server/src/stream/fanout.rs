//! One-to-many message fan-out.
//!
//! A [`Fanout`] wraps a `tokio::sync::broadcast` channel. Publishing never
//! waits on consumers: each [`Consumer`] has its own ring of `capacity`
//! slots and a consumer that falls behind skips the oldest messages
//! instead of stalling the publisher or its peers.

use std::sync::Arc;

use metrics::counter;
use relay_core::{ClientId, Message};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::BROADCAST_LAGGED_TOTAL;

/// Publisher side of an endpoint's broadcast stream.
#[derive(Debug)]
pub struct Fanout {
    tx: broadcast::Sender<Arc<Message>>,
}

impl Fanout {
    /// Create a fan-out retaining up to `capacity` messages per consumer.
    ///
    /// `capacity` must be non-zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver `message` to every attached consumer.
    ///
    /// Returns the number of consumers that will see it; zero consumers is
    /// not an error.
    pub fn publish(&self, message: Message) -> usize {
        self.tx.send(Arc::new(message)).unwrap_or(0)
    }

    /// Attach a new consumer under a fresh [`ClientId`].
    ///
    /// The consumer sees only messages published after this call and stops
    /// yielding once `cancel` fires.
    pub fn create_consumer(&self, cancel: CancellationToken) -> Consumer {
        Consumer {
            id: ClientId::new(),
            rx: self.tx.subscribe(),
            cancel,
        }
    }

    /// Consumers currently attached.
    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of a [`Fanout`], owned by one connection worker.
///
/// Dropping the consumer detaches it.
#[derive(Debug)]
pub struct Consumer {
    id: ClientId,
    rx: broadcast::Receiver<Arc<Message>>,
    cancel: CancellationToken,
}

impl Consumer {
    /// Id assigned at attach time.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Next published message, or `None` once cancelled or the fan-out is gone.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                received = self.rx.recv() => match received {
                    Ok(message) => return Some(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(client_id = %self.id, skipped, "consumer lagged, messages skipped");
                        counter!(BROADCAST_LAGGED_TOTAL).increment(skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}
