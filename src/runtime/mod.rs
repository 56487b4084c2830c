//! Small async coordination primitives shared across the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Cooperative cancellation flag. Every wait in the engine (token
/// acquisition, fetch, render, writer flush) selects against this so a
/// cancel transition unblocks it promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested. Safe to call repeatedly and
    /// from many tasks.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Pause gate: workers park here while the scheduler is paused or the
/// memory governor has tripped.
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    inner: Arc<PauseInner>,
}

#[derive(Debug, Default)]
struct PauseInner {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this call changed the state.
    pub fn set_paused(&self, paused: bool) -> bool {
        let previous = self.inner.paused.swap(paused, Ordering::SeqCst);
        if previous != paused && !paused {
            self.inner.notify.notify_waiters();
        }
        previous != paused
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Wait until unpaused or `cancel` fires, whichever comes first.
    pub async fn wait_if_paused(&self, cancel: &CancelHandle) {
        while self.is_paused() && !cancel.is_cancelled() {
            let notified = self.inner.notify.notified();
            if !self.is_paused() || cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_unblocks_waiters() {
        let cancel = CancelHandle::new();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(task.await.unwrap());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn pause_gate_releases_on_unpause() {
        let gate = PauseGate::new();
        let cancel = CancelHandle::new();
        gate.set_paused(true);
        let g = gate.clone();
        let c = cancel.clone();
        let task = tokio::spawn(async move {
            g.wait_if_paused(&c).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        gate.set_paused(false);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("gate released")
            .unwrap();
    }
}
