//! Periodic room announcements.

use std::time::Duration;

use relay_core::Message;
use relay_server::StreamHub;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Greeting broadcast to the room on every tick.
pub fn greeting() -> Message {
    Message::with_event("test").with("message", "Hello, world!")
}

/// Broadcast `message` to `hub` every `period` until `cancel` fires.
///
/// The first announcement goes out one full period after start.
pub async fn run(hub: StreamHub, message: Message, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => hub.broadcast(message.clone()),
        }
    }
    debug!(endpoint = %hub.path(), "announcer stopped");
}
