//! Cooperative shutdown signalling.
//!
//! Every long-lived loop holds a clone of the same [`ShutdownHandle`] and
//! checks it between blocking operations. Stopping the handle wakes every
//! waiter at once.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable stop signal shared by the pipeline's tasks.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    /// Create a new, unsignalled handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal every holder to stop.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the stop signal is sent.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so this only ends once the flag flips.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
