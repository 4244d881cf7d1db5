//! An awaitable latch with `set`, `reset`, and timed/untimed waits.
//!
//! Modeled on `vector_buffers`'s `PollNotify` (a `tokio::sync::Notify`
//! wrapper): the `bool` state is serialized under a single
//! `parking_lot::Mutex`, and a `Notify` is used purely to wake parked
//! waiters — state transitions never run continuations while the mutex is
//! held.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// An awaitable latch. Once [`set`](ManualResetSignal::set), every current
/// and future wait observes "set" until [`reset`](ManualResetSignal::reset).
#[derive(Debug)]
pub struct ManualResetSignal {
    is_set: Mutex<bool>,
    notify: Notify,
}

impl Default for ManualResetSignal {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ManualResetSignal {
    /// Creates a new signal, initially set or not as requested.
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            is_set: Mutex::new(initially_set),
            notify: Notify::new(),
        }
    }

    /// Marks the signal as set, waking every current waiter. Idempotent.
    pub fn set(&self) {
        let mut is_set = self.is_set.lock();
        if !*is_set {
            *is_set = true;
        }
        drop(is_set);
        self.notify.notify_waiters();
    }

    /// Clears the signal. Has no effect if it was already non-set.
    pub fn reset(&self) {
        *self.is_set.lock() = false;
    }

    /// Whether the signal is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.is_set.lock()
    }

    /// Waits, without a timeout, until the signal is set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            // Arm the `Notified` future *before* the recheck below, so a
            // `set()` (which calls `notify_waiters()` after flipping the
            // bool) landing between the recheck and the `.await` is still
            // observed: `enable()` registers this waiter synchronously,
            // rather than only on first poll at the `.await` point.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the signal is set, the timeout elapses, or `token` is
    /// cancelled. Returns whether the signal was observed set.
    pub async fn wait_timeout(&self, token: &CancellationToken, timeout: Duration) -> bool {
        tokio::select! {
            biased;
            () = token.cancelled() => false,
            () = self.wait() => true,
            () = tokio::time::sleep(timeout) => self.is_set(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_once_set() {
        let signal = ManualResetSignal::new(false);
        signal.set();
        tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait should not block once set");
    }

    #[tokio::test]
    async fn wait_blocks_until_set_from_another_task() {
        let signal = Arc::new(ManualResetSignal::new(false));
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                signal.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.set();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should finish shortly after set")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_after_set_requires_another_set_to_unblock_new_waiters() {
        let signal = ManualResetSignal::new(false);
        signal.set();
        signal.reset();
        assert!(!signal.is_set());

        let result = tokio::time::timeout(Duration::from_millis(20), signal.wait()).await;
        assert!(result.is_err(), "should still be blocked after reset");
    }

    #[tokio::test]
    async fn wait_timeout_returns_false_on_timeout() {
        let signal = ManualResetSignal::new(false);
        let token = CancellationToken::new();
        let observed = signal.wait_timeout(&token, Duration::from_millis(10)).await;
        assert!(!observed);
    }

    #[tokio::test]
    async fn wait_timeout_returns_false_on_cancellation() {
        let signal = ManualResetSignal::new(false);
        let token = CancellationToken::new();
        token.cancel();
        let observed = signal.wait_timeout(&token, Duration::from_secs(10)).await;
        assert!(!observed);
    }

    #[tokio::test]
    async fn wait_timeout_returns_true_when_set_before_timeout() {
        let signal = Arc::new(ManualResetSignal::new(false));
        let token = CancellationToken::new();
        {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                signal.set();
            });
        }
        let observed = signal.wait_timeout(&token, Duration::from_secs(5)).await;
        assert!(observed);
    }
}
