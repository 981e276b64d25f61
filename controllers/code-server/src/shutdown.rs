//! Process-wide stop signal.
//!
//! One `ShutdownTrigger` fans out to any number of `Shutdown` handles. The
//! watcher, dispatcher and event sources select on `Shutdown::wait`.

use tokio::sync::watch;

/// Sending half; firing it (or dropping it) stops every `Shutdown` holder.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        // Receivers may all be gone already; nothing left to stop then.
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn wait(&mut self) {
        // wait_for errors only when the sender is gone, which also means stop.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
