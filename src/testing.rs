//! Test-support fakes: a manually-advanceable clock and a scriptable
//! [`Poller`](crate::subscriber::Poller), shared by this crate's own tests
//! and available to downstream crates under the `testing` feature.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    batch_builder::BatchOperationError,
    error::{Error, Result},
    subscriber::Poller,
    time::TimeSource,
};

/// A [`TimeSource`] whose clock only moves when explicitly
/// [`advance`](ManualTimeSource::advance)d, for tests that want to control
/// time without pausing the whole Tokio runtime.
pub struct ManualTimeSource {
    base: Instant,
    elapsed_millis: AtomicU64,
    notify: tokio::sync::Notify,
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimeSource {
    /// Creates a clock starting at the current real instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed_millis: AtomicU64::new(0),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Moves the clock forward by `by`, waking every pending `delay`.
    pub fn advance(&self, by: Duration) {
        self.elapsed_millis
            .fetch_add(u64::try_from(by.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl TimeSource for ManualTimeSource {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.elapsed_millis.load(Ordering::SeqCst))
    }

    async fn delay(&self, duration: Duration, token: &CancellationToken) -> Result<()> {
        let deadline = self.now() + duration;
        loop {
            if self.now() >= deadline {
                return Ok(());
            }
            // Arm the `Notified` future before rechecking the deadline, so
            // an `advance()` (line above's `notify_waiters()`) landing
            // between the check and the `select!` below is still observed
            // instead of being missed until some later advance.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.now() >= deadline {
                return Ok(());
            }
            tokio::select! {
                biased;
                () = token.cancelled() => return Err(Error::Cancelled),
                () = notified => {}
            }
        }
    }
}

/// A scriptable [`Poller`] over `u32` messages/receipts: messages are fed
/// in through the returned sender, and every `touch`/`delete` call is
/// recorded for assertions.
pub struct RecordingPoller {
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<u32>>,
    touched: Mutex<Vec<u32>>,
    deleted: Mutex<Vec<u32>>,
}

impl RecordingPoller {
    /// Builds a poller and the sender used to feed it messages.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedSender<u32>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                inbox: tokio::sync::Mutex::new(receiver),
                touched: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            },
            sender,
        )
    }

    /// Every receipt ever passed to `touch`, in call order.
    #[must_use]
    pub fn touched(&self) -> Vec<u32> {
        self.touched.lock().clone()
    }

    /// Every receipt ever passed to `delete`, in call order.
    #[must_use]
    pub fn deleted(&self) -> Vec<u32> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl Poller for RecordingPoller {
    type Message = u32;
    type Receipt = u32;

    fn receipt_for(&self, message: &u32) -> u32 {
        *message
    }

    fn identity_of(&self, receipt: &u32) -> String {
        receipt.to_string()
    }

    async fn receive(
        &self,
        _token: &CancellationToken,
    ) -> std::result::Result<Vec<u32>, BatchOperationError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(message) => Ok(vec![message]),
            None => Ok(Vec::new()),
        }
    }

    async fn delete(
        &self,
        receipts: Vec<u32>,
        _token: &CancellationToken,
    ) -> std::result::Result<Vec<u32>, BatchOperationError> {
        self.deleted.lock().extend(receipts.iter().copied());
        Ok(receipts)
    }

    async fn touch(
        &self,
        receipts: Vec<u32>,
        _token: &CancellationToken,
    ) -> std::result::Result<Vec<u32>, BatchOperationError> {
        self.touched.lock().extend(receipts.iter().copied());
        Ok(receipts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_time_source_delay_completes_on_advance() {
        let source = ManualTimeSource::new();
        let token = CancellationToken::new();
        let start = source.now();

        let handle = {
            let source = std::sync::Arc::new(source);
            let source_clone = std::sync::Arc::clone(&source);
            let task = tokio::spawn(async move {
                source_clone.delay(Duration::from_millis(100), &token).await
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
            source.advance(Duration::from_millis(50));
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(!task.is_finished());
            source.advance(Duration::from_millis(50));
            task
        };

        handle.await.unwrap().unwrap();
        let _ = start;
    }

    #[tokio::test]
    async fn manual_time_source_delay_is_cancellable() {
        let source = ManualTimeSource::new();
        let token = CancellationToken::new();
        token.cancel();
        let result = source.delay(Duration::from_secs(1), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn recording_poller_tracks_touch_and_delete_calls() {
        let (poller, sender) = RecordingPoller::new();
        sender.send(7).unwrap();
        let token = CancellationToken::new();

        let received = poller.receive(&token).await.unwrap();
        assert_eq!(received, vec![7]);

        poller.touch(vec![7], &token).await.unwrap();
        poller.delete(vec![7], &token).await.unwrap();

        assert_eq!(poller.touched(), vec![7]);
        assert_eq!(poller.deleted(), vec![7]);
    }
}
