//! Reads up to `max` items from an MPSC channel, optionally waiting a
//! bounded window for more to arrive after the first one does.
//!
//! Mirrors the read-loop shape of `vector_buffers`'s
//! `BufferReceiver::next` (poll, fall back, return what's available)
//! generalized to batch accumulation with a deadline.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    time::TimeSource,
};

/// Reads up to `max` items from `receiver`.
///
/// Blocks until at least one item is available or the channel is closed. If
/// the first arrival leaves the collected list shorter than `max` and
/// `delay` is greater than zero, keeps draining opportunistically for at
/// most `delay` (measured from the first arrival) or until `max` items have
/// been collected, whichever comes first.
///
/// Returns an empty `Vec` only when the channel is closed with nothing
/// buffered. Cancellation of `token` aborts with [`Error::Cancelled`].
pub async fn read_many<T>(
    receiver: &mut mpsc::UnboundedReceiver<T>,
    max: usize,
    delay: Duration,
    time_source: &impl TimeSource,
    token: &CancellationToken,
) -> Result<Vec<T>> {
    debug_assert!(max > 0);

    let first = tokio::select! {
        biased;
        () = token.cancelled() => return Err(Error::Cancelled),
        item = receiver.recv() => item,
    };

    let Some(first) = first else {
        return Ok(Vec::new());
    };

    let mut items = Vec::with_capacity(max.min(64));
    items.push(first);

    if items.len() >= max || delay.is_zero() {
        return Ok(items);
    }

    let deadline = time_source.now() + delay;
    while items.len() < max {
        let remaining = deadline.saturating_duration_since(time_source.now());
        if remaining.is_zero() {
            break;
        }
        // Waiting out the window through `time_source.delay` (rather than a
        // bare `tokio::time::sleep`) keeps this honoring whatever clock the
        // caller injected, and folds cancellation into the same future.
        tokio::select! {
            biased;
            item = receiver.recv() => match item {
                Some(item) => items.push(item),
                None => break,
            },
            result = time_source.delay(remaining, token) => match result {
                Ok(()) => break,
                Err(_) => return Err(Error::Cancelled),
            },
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemTimeSource;

    #[tokio::test]
    async fn returns_empty_on_closed_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        drop(tx);
        let token = CancellationToken::new();
        let items = read_many(&mut rx, 10, Duration::ZERO, &SystemTimeSource, &token)
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn returns_immediately_when_full_batch_available() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        for item in 0..5 {
            tx.send(item).unwrap();
        }
        let token = CancellationToken::new();
        let items = read_many(&mut rx, 5, Duration::from_secs(10), &SystemTimeSource, &token)
            .await
            .unwrap();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_up_to_delay_for_more_items() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        tx.send(0).unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { read_many(&mut rx, 10, Duration::from_millis(100), &SystemTimeSource, &token).await }
        });

        tokio::time::advance(Duration::from_millis(30)).await;
        tx.send(1).unwrap();
        tokio::time::advance(Duration::from_millis(30)).await;
        tx.send(2).unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        let items = handle.await.unwrap().unwrap();
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_read() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let token = CancellationToken::new();
        token.cancel();
        let result = read_many(&mut rx, 10, Duration::ZERO, &SystemTimeSource, &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
