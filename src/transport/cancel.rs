//! Cooperative cancellation shared between a caller and in-flight requests

use tokio::sync::watch;

use crate::error::{AutobidError, Result};

/// Receiving side of a cancellation flag.
///
/// Cloned into every transport that should stop when the owner flips the flag.
/// Once set the flag never resets.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side; dropping it without cancelling leaves receivers live forever
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    /// Wrap an existing shutdown channel
    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once the flag is set
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AutobidError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the flag is set. Never resolves if the sender is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let changed = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if changed.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
