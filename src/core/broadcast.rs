//! Latest-value fan-out of the job snapshot.
//!
//! Observers never get a queue of their own: every subscriber reads the same
//! overwritten value and is woken when it changes. A slow or disconnected
//! observer therefore cannot hold the engine back.

use tokio::sync::watch;

use crate::core::models::ProgressSnapshot;

#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::idle());
        Self { tx }
    }

    pub fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Replace the latest snapshot. Subscribers are only woken when it
    /// actually differs from the previous one.
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            primed: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Stream of snapshots. The first call to [`Subscription::next`] returns the
/// snapshot current at subscribe time; later calls wait for a change.
pub struct Subscription {
    rx: watch::Receiver<ProgressSnapshot>,
    primed: bool,
}

impl Subscription {
    /// Next snapshot, or `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<ProgressSnapshot> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }

        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
