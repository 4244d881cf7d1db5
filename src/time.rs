//! Abstraction over "now" and cancellable delays, so time-dependent behavior
//! can be driven deterministically under test.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{self, Result};

/// Abstract wall clock. Used by every suspension point in this crate that
/// waits for a duration to elapse, so that tests can swap in a clock they
/// control instead of sleeping in real time.
#[async_trait]
pub trait TimeSource: Send + Sync + 'static {
    /// The current instant, per this time source.
    fn now(&self) -> Instant;

    /// Waits until `duration` has elapsed, or until `token` is cancelled.
    async fn delay(&self, duration: Duration, token: &CancellationToken) -> Result<()>;
}

/// The real wall clock, backed directly by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

#[async_trait]
impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn delay(&self, duration: Duration, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(error::Error::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delay_completes_after_duration() {
        let source = SystemTimeSource;
        let token = CancellationToken::new();
        let start = source.now();
        source
            .delay(Duration::from_millis(50), &token)
            .await
            .unwrap();
        assert!(source.now() >= start + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn delay_is_cancelled_by_token() {
        let source = SystemTimeSource;
        let token = CancellationToken::new();
        token.cancel();
        let result = source.delay(Duration::from_secs(10), &token).await;
        assert!(matches!(result, Err(error::Error::Cancelled)));
    }
}
