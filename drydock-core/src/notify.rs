//! Level-triggered change notification.
//!
//! After every successful push the writer signals all subscribers. A
//! lagging subscriber coalesces signals: it observes "at least one
//! update since last look", never a count.

use tokio::sync::watch;

/// Fan-out point owned by the repository.
#[derive(Debug)]
pub struct Notify {
    tx: watch::Sender<u64>,
}

impl Notify {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Signal all current subscribers.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Acquire a subscription. Safe from any task.
    pub fn subscribe(&self) -> Subscription {
        let mut rx = self.tx.subscribe();
        // Start "caught up" with the current level.
        rx.borrow_and_update();
        Subscription { rx }
    }
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber handle. Dropped to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<u64>,
}

impl Subscription {
    /// Wait until at least one notification arrived since the last
    /// observation. Returns `false` once the notifier is gone.
    pub async fn wait(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Non-blocking check-and-clear of the pending level.
    pub fn pending(&mut self) -> bool {
        self.rx.has_changed().map(|changed| {
            if changed {
                self.rx.borrow_and_update();
            }
            changed
        }).unwrap_or(false)
    }
}
