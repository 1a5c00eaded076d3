//! Auto-reset event signals: a one-shot latch that `wait` consumes, so
//! each `set` releases at most one waiter.
//!
//! `tokio::sync::Notify` already has almost this shape (`notify_one` wakes
//! at most one pending `notified()`), but it drops a `notify_one` call that
//! arrives with nobody waiting. We want callers that poll between waits to
//! still observe a `set()` that happened just before they called `wait()`,
//! so we pair `Notify` with a permit flag: `set()` stores a permit if
//! nobody was already parked in `notified()`, and `wait()` consumes a
//! stored permit immediately instead of sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub struct EventSignal {
    permit: AtomicBool,
    notify: Notify,
}

impl EventSignal {
    pub fn new() -> Self {
        EventSignal { permit: AtomicBool::new(false), notify: Notify::new() }
    }

    /// Release at most one waiter. If nobody is waiting yet, the next
    /// `wait()` call returns immediately instead of blocking.
    pub fn set(&self) {
        self.permit.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume one permit, blocking until `set()` is called if none is
    /// currently available.
    pub async fn wait(&self) {
        loop {
            if self.permit.swap(false, Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for EventSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The four observable events a swarm emits.
#[derive(Default)]
pub struct Events {
    pub delta_received: EventSignal,
    pub delta_distributed: EventSignal,
    pub tx_received: EventSignal,
    pub block_received: EventSignal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn set_before_wait_is_not_lost() {
        let sig = EventSignal::new();
        sig.set();
        tokio::time::timeout(Duration::from_millis(50), sig.wait())
            .await
            .expect("wait should return immediately");
    }

    #[tokio::test]
    async fn set_releases_at_most_one_waiter() {
        let sig = Arc::new(EventSignal::new());
        let a = tokio::spawn({
            let sig = Arc::clone(&sig);
            async move {
                sig.wait().await;
            }
        });
        let b = tokio::spawn({
            let sig = Arc::clone(&sig);
            async move {
                sig.wait().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sig.set();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let a_done = a.is_finished();
        let b_done = b.is_finished();
        assert!(a_done ^ b_done, "exactly one waiter should have been released");

        sig.set();
        a.await.unwrap();
        b.await.unwrap();
    }
}
