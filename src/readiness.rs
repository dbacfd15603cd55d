//! Readiness gate between subscription setup and bulk sync.
//!
//! A single boolean with last-value memory: an observer that subscribes after
//! [`ReadinessSignal::set`] still sees `true`. Backed by a `watch` channel, so
//! readers never block the writer and vice versa.

use std::sync::Arc;

use tokio::sync::watch;

/// "Subscriptions are registered" signal.
///
/// Starts `false` and flips to `true` once; it never flips back.
#[derive(Clone)]
pub struct ReadinessSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Marks subscriptions as registered.
    ///
    /// Repeat calls leave the state unchanged but still notify observers.
    pub fn set(&self) {
        let was_set = self.tx.send_replace(true);
        if was_set {
            tracing::debug!("Readiness signal set again");
        } else {
            tracing::info!("Subscriptions registered event emitted");
        }
    }

    /// Current value.
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Creates an observer. Its [`current`](ReadinessObserver::current) value
    /// is available immediately.
    pub fn subscribe(&self) -> ReadinessObserver {
        ReadinessObserver {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber to a [`ReadinessSignal`]. Dropping it unsubscribes.
pub struct ReadinessObserver {
    rx: watch::Receiver<bool>,
}

impl ReadinessObserver {
    /// Value at the time of the last observation.
    pub fn current(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the next notification and returns the value it carried.
    ///
    /// Returns `None` once the signal has been dropped.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Resolves as soon as the signal is `true`, immediately if it already is.
    ///
    /// Returns `false` if the signal was dropped without ever being set.
    pub async fn wait_ready(&mut self) -> bool {
        self.rx.wait_for(|ready| *ready).await.is_ok()
    }

    /// Stops receiving notifications.
    pub fn unsubscribe(self) {
        drop(self);
    }
}
