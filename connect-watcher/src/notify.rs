use tokio::sync::mpsc;

/// Signals that watched state changed. Cloned into every watch.
#[derive(Clone, Debug)]
pub(crate) struct Notifier(mpsc::Sender<()>);

/// Receives coalesced change signals.
#[derive(Debug)]
pub(crate) struct Changes(mpsc::Receiver<()>);

/// Creates a single-slot change channel.
///
/// At most one signal is ever pending: notifying while a signal is pending is a no-op, so any
/// number of changes before the receiver drains collapses into one.
pub(crate) fn channel() -> (Notifier, Changes) {
    let (tx, rx) = mpsc::channel(1);
    (Notifier(tx), Changes(rx))
}

// === impl Notifier ===

impl Notifier {
    pub(crate) fn notify(&self) {
        // Full means a signal is already pending; closed means nobody is listening.
        let _ = self.0.try_send(());
    }
}

// === impl Changes ===

impl Changes {
    /// Waits for a pending signal. Returns false once all notifiers are dropped.
    pub(crate) async fn changed(&mut self) -> bool {
        self.0.recv().await.is_some()
    }
}
