//! Cooperative cancellation for async command execution.
//!
//! The bus forwards a [`CancelToken`] verbatim to async handlers; it never
//! inspects or acts on the signal itself.

use tokio::sync::watch;

/// Owning side of a cancellation signal.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// Create a new, uncancelled source.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal cancellation to every outstanding token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal, handed to async handlers.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested. Pends forever on a token
    /// whose source was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        futures::future::pending::<()>().await;
    }
}
