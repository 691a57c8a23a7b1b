//! One-shot signals and first-write-wins error slots

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio::sync::Notify;

use crate::error::Error;

/// A flag that is raised once and stays raised; waiters are woken on raise
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns true for the call that raised it.
    pub fn fire(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait until the signal is raised
    pub async fn fired(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent fire() is not missed.
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// Holds the first error reported to it
#[derive(Debug, Default)]
pub struct ErrorLatch {
    slot: OnceLock<Error>,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `err` unless an error is already latched. Returns true if stored.
    pub fn set(&self, err: Error) -> bool {
        self.slot.set(err).is_ok()
    }

    pub fn get(&self) -> Option<Error> {
        self.slot.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fire_once() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_fired_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.fired().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fired_after_fire_returns_immediately() {
        let signal = Signal::new();
        signal.fire();
        tokio::time::timeout(Duration::from_millis(100), signal.fired())
            .await
            .unwrap();
    }

    #[test]
    fn test_latch_keeps_first_error() {
        let latch = ErrorLatch::new();
        assert!(latch.get().is_none());
        assert!(latch.set(Error::AuthFailed));
        assert!(!latch.set(Error::Timeout));
        assert!(matches!(latch.get(), Some(Error::AuthFailed)));
    }
}
