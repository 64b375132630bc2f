//! One-shot completion signal.
//!
//! Wraps a tokio watch channel carrying a single `bool` that flips from `false` to `true`
//! exactly once. Any number of [`Completion`] handles can observe the flip, including handles
//! created after it happened.

use tokio::sync::watch;

/// Transmitter side of a completion signal.
pub type CompletionTx = watch::Sender<bool>;

/// Creates a new, not yet fired, completion signal.
pub fn create_completion() -> CompletionTx {
    let (tx, _) = watch::channel(false);
    tx
}

/// Fires the completion signal.
///
/// Returns `true` only for the call that actually performed the transition, every later call
/// is a no-op returning `false`.
pub fn fire_once(tx: &CompletionTx) -> bool {
    tx.send_if_modified(|fired| {
        if *fired {
            return false;
        }

        *fired = true;
        true
    })
}

/// Receiver side of a completion signal.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    /// Subscribes a new handle to `tx`.
    pub fn subscribe(tx: &CompletionTx) -> Self {
        Self { rx: tx.subscribe() }
    }

    /// Returns `true` once the signal has fired.
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the signal fires.
    ///
    /// Returns immediately if it already fired. If the transmitter is dropped without firing,
    /// this returns as well since no completion can be observed anymore.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}
