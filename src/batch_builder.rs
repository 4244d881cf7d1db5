//! Request coalescer with key-based demultiplexing.
//!
//! The reader loop reuses [`read_many`](crate::read_many::read_many) for its
//! accumulation window, and the per-batch concurrency bound is a
//! `tokio::sync::Semaphore` acquired before dispatch and released when the
//! user callback returns — the same "acquire an owned permit, hold it across
//! the await, drop to release" shape `vector_buffers`'s `PollSemaphore`
//! wraps for its batch-admission gate.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    read_many::read_many,
    settings::BatchBuilderSettings,
    time::TimeSource,
};

/// The user-supplied many-at-a-time operation a [`BatchBuilder`] coalesces
/// requests into.
#[async_trait]
pub trait BatchOperation<Req, Resp>: Send + Sync + 'static {
    /// Runs the batch, returning one response per input it could satisfy.
    /// Responses need not cover every input and must not contain duplicate
    /// keys; a thrown error fails the whole group.
    async fn run_batch(
        &self,
        requests: Vec<Req>,
    ) -> std::result::Result<Vec<Resp>, BatchOperationError>;
}

/// The error type a [`BatchOperation`] fails a batch with; wrapped into
/// [`Error::BatchFailed`] for every mailbox in the group.
pub type BatchOperationError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
impl<Req, Resp, F, Fut> BatchOperation<Req, Resp> for F
where
    F: Fn(Vec<Req>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<Vec<Resp>, BatchOperationError>> + Send,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn run_batch(
        &self,
        requests: Vec<Req>,
    ) -> std::result::Result<Vec<Resp>, BatchOperationError> {
        self(requests).await
    }
}

struct Mailbox<Req, Resp> {
    request: Req,
    reply: oneshot::Sender<Result<Resp>>,
}

/// Coalesces many concurrent single-item requests into bounded-size batched
/// calls, and demultiplexes the responses back to the individual callers.
///
/// `K` is the fingerprint type correlating a request with its response. Two
/// requests sharing a key are served by one call and share the response;
/// this requires `Resp: Clone` so every waiter on a shared key can receive
/// its own copy.
pub struct BatchBuilder<Req, Resp, K> {
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Mailbox<Req, Resp>>>>,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    token: CancellationToken,
    disposed: std::sync::atomic::AtomicBool,
    _key: std::marker::PhantomData<fn() -> K>,
}

impl<Req, Resp, K> BatchBuilder<Req, Resp, K>
where
    Req: Send + 'static,
    Resp: Clone + Send + 'static,
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    /// Builds and starts a `BatchBuilder`. `key_of_request`/`key_of_response`
    /// extract the correlating key from each side; `operation` is the
    /// user's many-at-a-time call.
    #[must_use]
    pub fn new<KReq, KResp, Op>(
        settings: BatchBuilderSettings,
        key_of_request: KReq,
        key_of_response: KResp,
        operation: Op,
        time_source: Arc<dyn TimeSource>,
    ) -> Self
    where
        KReq: Fn(&Req) -> K + Send + Sync + 'static,
        KResp: Fn(&Resp) -> K + Send + Sync + 'static,
        Op: BatchOperation<Req, Resp>,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Mailbox<Req, Resp>>();
        let token = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(settings.concurrency));
        let operation = Arc::new(operation);
        let key_of_request = Arc::new(key_of_request);
        let key_of_response = Arc::new(key_of_response);

        let reader_token = token.clone();
        let reader = tokio::spawn(async move {
            loop {
                let group = match read_many(
                    &mut receiver,
                    settings.batch_size,
                    settings.batch_delay,
                    time_source.as_ref(),
                    &reader_token,
                )
                .await
                {
                    Ok(group) if group.is_empty() => break,
                    Ok(group) => group,
                    Err(Error::Cancelled) => break,
                    Err(_) => break,
                };

                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let operation = Arc::clone(&operation);
                let key_of_request = Arc::clone(&key_of_request);
                let key_of_response = Arc::clone(&key_of_response);
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch_group(
                        group,
                        operation.as_ref(),
                        key_of_request.as_ref(),
                        key_of_response.as_ref(),
                    )
                    .await;
                });
            }
            // Drain whatever is left unread after the loop exits (disposal
            // or channel closure) so no mailbox is silently forgotten.
            receiver.close();
            while let Ok(mailbox) = receiver.try_recv() {
                let _ = mailbox.reply.send(Err(Error::Cancelled));
            }
        });

        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            reader: parking_lot::Mutex::new(Some(reader)),
            token,
            disposed: std::sync::atomic::AtomicBool::new(false),
            _key: std::marker::PhantomData,
        }
    }

    /// Enqueues `request`, returning a future that resolves to the response
    /// sharing its key, fails with [`Error::MissingResponse`] if the batch
    /// omitted it, or propagates the batch's own failure.
    pub async fn request(&self, request: Req) -> Result<Resp> {
        let (reply, receiver) = oneshot::channel();
        let sent = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => sender.send(Mailbox { request, reply }),
                None => return Err(Error::Cancelled),
            }
        };
        sent.map_err(|_| Error::Cancelled)?;
        receiver.await.map_err(|_| Error::Cancelled)?
    }

    /// Stops accepting new requests and waits for currently buffered ones
    /// to drain through the normal path. Idempotent.
    pub async fn dispose(&self) {
        if self
            .disposed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.sender.lock().take();
        self.token.cancel();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }
}

impl<Req, Resp, K> Drop for BatchBuilder<Req, Resp, K> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn dispatch_group<Req, Resp, K>(
    group: Vec<Mailbox<Req, Resp>>,
    operation: &(dyn BatchOperation<Req, Resp>),
    key_of_request: &(dyn Fn(&Req) -> K + Send + Sync),
    key_of_response: &(dyn Fn(&Resp) -> K + Send + Sync),
) where
    Resp: Clone,
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    // Group by key, preserving first-arrival order of distinct keys: the
    // representative request sent to the user operation is the first
    // mailbox seen for that key, but every mailbox sharing the key is
    // remembered as a waiter.
    let mut order: Vec<K> = Vec::new();
    let mut waiters: HashMap<K, Vec<oneshot::Sender<Result<Resp>>>> = HashMap::new();
    let mut representatives: HashMap<K, Req> = HashMap::new();

    for mailbox in group {
        let key = key_of_request(&mailbox.request);
        if !representatives.contains_key(&key) {
            order.push(key.clone());
            representatives.insert(key.clone(), mailbox.request);
        }
        waiters.entry(key).or_default().push(mailbox.reply);
    }

    let inputs: Vec<Req> = order
        .iter()
        .map(|key| {
            representatives
                .remove(key)
                .expect("representative present for every key in order")
        })
        .collect();

    match operation.run_batch(inputs).await {
        Ok(responses) => {
            let mut by_key: HashMap<K, Resp> = HashMap::new();
            for response in responses {
                by_key.insert(key_of_response(&response), response);
            }
            for key in order {
                let Some(senders) = waiters.remove(&key) else {
                    continue;
                };
                match by_key.get(&key) {
                    Some(response) => {
                        for sender in senders {
                            let _ = sender.send(Ok(response.clone()));
                        }
                    }
                    None => {
                        for sender in senders {
                            let _ = sender.send(Err(Error::missing_response(&key)));
                        }
                    }
                }
            }
        }
        Err(source) => {
            let error = Error::batch_failed(BoxedError(source));
            for (_, senders) in waiters {
                for sender in senders {
                    let _ = sender.send(Err(error.clone()));
                }
            }
        }
    }
}

#[derive(Debug)]
struct BoxedError(BatchOperationError);

impl std::fmt::Display for BoxedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for BoxedError {}
