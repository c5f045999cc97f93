//! Connection drain tracking for graceful stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Signals open connections to stop and waits for them to finish.
#[derive(Clone)]
pub struct DrainController {
    stop_tx: Arc<watch::Sender<bool>>,
    open: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl DrainController {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx: Arc::new(stop_tx),
            open: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Receiver that resolves once [`DrainController::stop`] is called.
    ///
    /// Subscribing after the stop still observes it.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Signal every connection to stop. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        let first = !self.stop_tx.send_replace(true);
        if first && self.open_connections() == 0 {
            self.drained.notify_waiters();
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Track a connection until the guard is dropped.
    pub fn track(&self) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            controller: self.clone(),
        }
    }

    fn release(&self) {
        let prev = self.open.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_stopped() {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every tracked connection finished, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drained.notified();
        tokio::pin!(drained);
        drained.as_mut().enable();

        if self.open_connections() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    open = self.open_connections(),
                    "drain timeout, connections still open"
                );
                false
            }
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the open connection count on drop.
pub struct ConnectionGuard {
    controller: DrainController,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller.release();
    }
}

/// Resolve once `rx` observes a stop.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}
