//! One-shot broadcast events.
//!
//! Commit and execute notifications have many waiters and fire exactly once
//! in an instance's lifetime. Waiters capture the `Notified` future before
//! re-checking the fired flag, so a fire landing between the check and the
//! await cannot be lost.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio::time::{self, Instant};

#[derive(Debug, Default)]
pub(crate) struct Event {
    fired: AtomicBool,
    notify: Notify,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.has_fired() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the event fires or the deadline passes. Returns whether the
    /// event fired.
    pub(crate) async fn wait_until(&self, deadline: Instant) -> bool {
        time::timeout_at(deadline, self.wait()).await.is_ok()
    }
}
