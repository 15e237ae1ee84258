//! Cancellation plumbing shared by the long-lived worker loops.

use tokio::sync::watch;

/// One-shot broadcast used for shutdown and seal cancellation.
///
/// A `Notifier` owns the signal; every [`Noticer`] obtained through
/// [`Notifier::subscribe`] resolves once [`Notifier::notify`] fires. Dropping
/// the notifier releases waiters as well, so an abandoned owner cannot strand
/// its listeners.
#[derive(Debug)]
pub struct Notifier {
    tx: watch::Sender<bool>,
}

impl Notifier {
    /// Create an unfired notifier.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Idempotent.
    pub fn notify(&self) {
        let _ = self.tx.send(true);
    }

    /// Obtain a listener for the signal.
    pub fn subscribe(&self) -> Noticer {
        Noticer { rx: self.tx.subscribe() }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Listening half of a [`Notifier`].
#[derive(Clone, Debug)]
pub struct Noticer {
    rx: watch::Receiver<bool>,
}

impl Noticer {
    /// Wait until the owning notifier fires or is dropped.
    pub async fn recv(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
