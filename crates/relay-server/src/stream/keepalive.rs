//! Idle timer for stream connections.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Resettable deadline that fires after `interval` without activity.
///
/// Once fired it stays fired until [`reset`](Self::reset) re-arms it.
#[derive(Debug)]
pub struct Keepalive {
    interval: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl Keepalive {
    /// Arm a timer that first fires `interval` from now.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sleep: Box::pin(tokio::time::sleep(interval)),
        }
    }

    /// Wait for the deadline.
    pub async fn fired(&mut self) {
        self.sleep.as_mut().await;
    }

    /// Push the deadline to `interval` from now.
    pub fn reset(&mut self) {
        let deadline = Instant::now() + self.interval;
        self.sleep.as_mut().reset(deadline);
    }
}
