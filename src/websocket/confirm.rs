//! Single-shot confirmation slots
//!
//! A [`ConfirmSlot`] is held by whoever will observe the server's answer (a
//! registry entry, a pending command); the matching [`Confirmation`] is held
//! by the caller waiting for it. Only the first `resolve` is delivered.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Why a wait ended without a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Nothing arrived within the timeout
    Timeout,
    /// The slot was dropped without being resolved
    Abandoned,
}

/// Resolving half of a confirmation
#[derive(Debug)]
pub struct ConfirmSlot<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

/// Waiting half of a confirmation
#[derive(Debug)]
pub struct Confirmation<T> {
    rx: oneshot::Receiver<T>,
}

/// Create a connected slot/confirmation pair
pub fn confirmation<T>() -> (ConfirmSlot<T>, Confirmation<T>) {
    let (tx, rx) = oneshot::channel();
    (
        ConfirmSlot {
            tx: Mutex::new(Some(tx)),
        },
        Confirmation { rx },
    )
}

impl<T> ConfirmSlot<T> {
    /// Deliver the result. Returns false if the slot was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The waiter may have timed out already; the slot still counts as resolved
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> Confirmation<T> {
    /// Park until the slot is resolved or the timeout elapses
    pub async fn wait(self, timeout: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}
