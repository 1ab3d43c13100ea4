//! Cooperative cancellation for long-running commit retries.
//!
//! Every public operation in the two-phase transaction manager accepts
//! one of these; a randomized backoff sleep ("100-600 ms")
//! is an explicit suspension point and must race against cancellation
//! so a caller can abort a long retry loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A cheaply cloneable, thread-safe cancellation flag.
///
/// Unlike a full `tokio_util::sync::CancellationToken` dependency, this
/// is the minimal shape a "coroutine/async commit" design
/// note calls for: a flag plus a way to race a sleep against it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`CancellationToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, or return early if cancelled mid-sleep.
    ///
    /// Returns `true` if the sleep completed, `false` if cancellation
    /// won the race.
    pub async fn sleep_or_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait_for_cancel() => false,
        }
    }

    async fn wait_for_cancel(&self) {
        // Coarse poll: cancellation is a rare, caller-driven event, so a
        // tight poll loop is fine and avoids pulling in a condvar/notify
        // dependency just for this.
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
