//! Single-slot timer: arming replaces any pending firing.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// At most one pending action at a time. Re-arming cancels the previous one.
///
/// Cancellation only prevents an action that has not fired yet; once the
/// delay elapses the action runs to completion.
#[derive(Default)]
pub struct SingleSlotTimer {
    slot: Mutex<Option<CancellationToken>>,
}

impl SingleSlotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, replacing any pending one.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Disarm before running so `is_armed` reflects reality.
                    token.cancel();
                    action.await;
                }
            }
        });
    }

    /// Cancel the pending action, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.lock().take() {
            Some(token) => {
                let was_pending = !token.is_cancelled();
                token.cancel();
                was_pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().as_ref().is_some_and(|t| !t.is_cancelled())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SingleSlotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
