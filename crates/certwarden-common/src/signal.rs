//! One-shot, close-once signals
//!
//! A [`Signal`] starts unfired and can be fired exactly once; firing again is
//! a no-op. Any number of clones may wait on it. It is a thin wrapper over
//! [`CancellationToken`], which already has these semantics.

use tokio_util::sync::CancellationToken;

/// A cloneable signal that fires once and stays fired
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    /// Create an unfired signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the signal has fired
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires; returns immediately if it already has
    pub async fn fired(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_exactly_once() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn clones_observe_the_same_fire() {
        let signal = Signal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move {
            waiter.fired().await;
        });

        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn waiting_on_fired_signal_returns_immediately() {
        let signal = Signal::new();
        signal.fire();
        tokio::time::timeout(Duration::from_millis(50), signal.fired())
            .await
            .expect("already-fired signal should not block");
    }
}
