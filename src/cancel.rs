//! Single-signal cancellation threaded from the scheduler down to the
//! sandbox provider.
//!
//! One [`CancelToken`] exists per job; the orchestrator forwards a
//! subscribed [`CancelSignal`] into the stage runner, which hands it to
//! the provider's `exec`. Cancelling is idempotent and cancelling an
//! already-terminal run is a no-op.

use std::sync::Arc;

use tokio::sync::watch;

/// Owning side of the cancellation signal. Cheap to clone; every clone
/// fires the same signal.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Safe to call more than once.
    pub fn cancel(&self) {
        // send_replace never fails; late receivers observe the flag.
        let _ = self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A cheap, clonable view of the signal.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the cancellation signal.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for contexts without a cancel source.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal fires. If the token was dropped without
    /// firing, this pends forever — callers always race it against the
    /// work they are guarding.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                // Sender dropped without cancelling; park indefinitely.
                std::future::pending::<()>().await;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }
}
